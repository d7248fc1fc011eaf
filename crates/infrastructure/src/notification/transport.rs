use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use transcoder_core::models::{NotificationOutcome, NotificationTarget};

/// 单次投递结果
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivered: bool,
    pub outcome: NotificationOutcome,
}

impl Delivery {
    pub fn delivered(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            delivered: true,
            outcome: NotificationOutcome {
                message: message.into(),
                status_code,
            },
        }
    }

    pub fn failed(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            delivered: false,
            outcome: NotificationOutcome {
                message: message.into(),
                status_code,
            },
        }
    }
}

/// 把一条通知送到外部目标，失败以 `Delivery::failed` 返回而不是错误
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn deliver(&self, target: &NotificationTarget, payload: &Value) -> Delivery;
}

/// HTTP(S) 回调
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    async fn send(
        &self,
        url: &str,
        method: &str,
        headers: &std::collections::BTreeMap<String, String>,
        payload: &Value,
    ) -> Delivery {
        let method = match reqwest::Method::from_str(&method.to_uppercase()) {
            Ok(method) => method,
            Err(_) => return Delivery::failed(format!("不支持的HTTP方法: {method}"), None),
        };

        let mut request = self.client.request(method, url).json(payload);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Delivery::delivered(format!("HTTP {status}"), Some(status.as_u16()))
                } else {
                    let body = response.text().await.unwrap_or_default();
                    Delivery::failed(
                        format!("HTTP {status} - {}", truncate(&body, 512)),
                        Some(status.as_u16()),
                    )
                }
            }
            Err(e) => Delivery::failed(format!("HTTP请求失败: {e}"), None),
        }
    }
}

#[async_trait]
impl NotificationTransport for HttpTransport {
    async fn deliver(&self, target: &NotificationTarget, payload: &Value) -> Delivery {
        match target {
            NotificationTarget::Http {
                url,
                method,
                headers,
            } => self.send(url, method, headers, payload).await,
            other => Delivery::failed(format!("HTTP通道不支持 {} 目标", other.kind()), None),
        }
    }
}

/// Redis PUBLISH，按 url 复用连接
pub struct RedisTransport {
    default_url: Option<String>,
    connections: Mutex<HashMap<String, redis::aio::ConnectionManager>>,
}

impl RedisTransport {
    pub fn new(default_url: Option<String>) -> Self {
        Self {
            default_url,
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn connection(&self, url: &str) -> redis::RedisResult<redis::aio::ConnectionManager> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(url) {
            return Ok(conn.clone());
        }
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        connections.insert(url.to_string(), conn.clone());
        Ok(conn)
    }

    async fn publish(&self, url: &str, channel: &str, payload: &Value) -> Delivery {
        let mut conn = match self.connection(url).await {
            Ok(conn) => conn,
            Err(e) => return Delivery::failed(format!("Redis连接失败: {e}"), None),
        };
        let message = payload.to_string();
        let result: redis::RedisResult<i64> = conn.publish(channel, message).await;
        match result {
            Ok(receivers) => {
                debug!("发布通知到 {} ({} 个订阅者)", channel, receivers);
                Delivery::delivered(format!("published to {receivers} subscribers"), None)
            }
            Err(e) => Delivery::failed(format!("Redis发布失败: {e}"), None),
        }
    }
}

#[async_trait]
impl NotificationTransport for RedisTransport {
    async fn deliver(&self, target: &NotificationTarget, payload: &Value) -> Delivery {
        match target {
            NotificationTarget::Redis { url, channel } => {
                let Some(url) = url.as_deref().or(self.default_url.as_deref()) else {
                    return Delivery::failed("未配置Redis地址", None);
                };
                self.publish(url, channel, payload).await
            }
            other => Delivery::failed(format!("Redis通道不支持 {} 目标", other.kind()), None),
        }
    }
}

/// 按目标类型选择具体通道
pub struct CompositeTransport {
    http: HttpTransport,
    redis: RedisTransport,
}

impl CompositeTransport {
    pub fn new(timeout: Duration, redis_url: Option<String>) -> Self {
        Self {
            http: HttpTransport::new(timeout),
            redis: RedisTransport::new(redis_url),
        }
    }
}

#[async_trait]
impl NotificationTransport for CompositeTransport {
    async fn deliver(&self, target: &NotificationTarget, payload: &Value) -> Delivery {
        match target {
            NotificationTarget::Http { .. } => self.http.deliver(target, payload).await,
            NotificationTarget::Redis { .. } => self.redis.deliver(target, payload).await,
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_unsupported_http_method() {
        let transport = HttpTransport::new(Duration::from_secs(1));
        let target = NotificationTarget::Http {
            url: "http://127.0.0.1:9/hook".to_string(),
            method: "NOT A METHOD".to_string(),
            headers: BTreeMap::new(),
        };
        let delivery = transport.deliver(&target, &serde_json::json!({})).await;
        assert!(!delivery.delivered);
        assert!(delivery.outcome.message.contains("不支持的HTTP方法"));
    }

    #[tokio::test]
    async fn test_redis_target_without_url() {
        let transport = RedisTransport::new(None);
        let target = NotificationTarget::Redis {
            url: None,
            channel: "jobs".to_string(),
        };
        let delivery = transport.deliver(&target, &serde_json::json!({})).await;
        assert!(!delivery.delivered);
        assert_eq!(delivery.outcome.message, "未配置Redis地址");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("转码完成", 2), "转码");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
