use async_trait::async_trait;
use sqlx::types::Json;
use tracing::debug;
use transcoder_core::{
    models::JobOutput, traits::JobOutputRepository, TranscoderError, TranscoderResult,
};

use super::manager::{with_pool, DatabasePool};

const OUTPUT_COLUMNS: &str = "key, job_key, idx, specs, outcome, status, try_max, try_count, \
    retry_in, started_at, processed_at, uploaded_at, completed_at, updated_at, created_at";

pub struct SqlJobOutputRepository {
    pool: DatabasePool,
}

impl SqlJobOutputRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobOutputRepository for SqlJobOutputRepository {
    async fn create(&self, output: &JobOutput) -> TranscoderResult<()> {
        let sql = format!(
            "INSERT INTO jobs_outputs ({OUTPUT_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        );
        with_pool!(&self.pool, p => {
            sqlx::query(&sql)
                .bind(&output.key)
                .bind(&output.job_key)
                .bind(output.index)
                .bind(Json(&output.specs))
                .bind(Json(&output.outcome))
                .bind(output.status)
                .bind(output.try_max)
                .bind(output.try_count)
                .bind(output.retry_in)
                .bind(output.started_at)
                .bind(output.processed_at)
                .bind(output.uploaded_at)
                .bind(output.completed_at)
                .bind(output.updated_at)
                .bind(output.created_at)
                .execute(p)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;
        Ok(())
    }

    async fn list_by_job(&self, job_key: &str) -> TranscoderResult<Vec<JobOutput>> {
        let sql =
            format!("SELECT {OUTPUT_COLUMNS} FROM jobs_outputs WHERE job_key = $1 ORDER BY idx ASC");
        let outputs = with_pool!(&self.pool, p => {
            sqlx::query_as::<_, JobOutput>(&sql).bind(job_key).fetch_all(p).await
        })
        .map_err(TranscoderError::Database)?;
        Ok(outputs)
    }

    async fn update(&self, output: &JobOutput) -> TranscoderResult<()> {
        let affected = with_pool!(&self.pool, p => {
            sqlx::query(
                r#"
                UPDATE jobs_outputs SET
                    specs = $2, outcome = $3, status = $4, try_max = $5, try_count = $6,
                    retry_in = $7, started_at = $8, processed_at = $9, uploaded_at = $10,
                    completed_at = $11, updated_at = $12
                WHERE key = $1
                "#,
            )
            .bind(&output.key)
            .bind(Json(&output.specs))
            .bind(Json(&output.outcome))
            .bind(output.status)
            .bind(output.try_max)
            .bind(output.try_count)
            .bind(output.retry_in)
            .bind(output.started_at)
            .bind(output.processed_at)
            .bind(output.uploaded_at)
            .bind(output.completed_at)
            .bind(output.updated_at)
            .execute(p)
            .await
            .map(|r| r.rows_affected())
        })
        .map_err(TranscoderError::Database)?;

        if affected == 0 {
            return Err(TranscoderError::DatabaseOperation(format!(
                "任务输出不存在: {}",
                output.key
            )));
        }
        debug!("更新任务输出 {} -> {}", output.key, output.status);
        Ok(())
    }

    async fn delete_by_jobs(&self, job_keys: &[String]) -> TranscoderResult<u64> {
        let mut affected = 0;
        for job_key in job_keys {
            affected += with_pool!(&self.pool, p => {
                sqlx::query("DELETE FROM jobs_outputs WHERE job_key = $1")
                    .bind(job_key)
                    .execute(p)
                    .await
                    .map(|r| r.rows_affected())
            })
            .map_err(TranscoderError::Database)?;
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use chrono::Utc;
    use transcoder_core::models::{OutputSpec, OutputStatus, VideoSpec};

    #[tokio::test]
    async fn test_outputs_are_listed_in_index_order() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = db.job_output_repository();
        let now = Utc::now();

        let mut spec = OutputSpec::new("mp4");
        spec.video = Some(VideoSpec {
            codec: "libx264".to_string(),
            height: Some(720),
            ..Default::default()
        });
        repo.create(&JobOutput::new("job-1", 1, OutputSpec::new("webm"), now))
            .await
            .unwrap();
        repo.create(&JobOutput::new("job-1", 0, spec.clone(), now))
            .await
            .unwrap();

        let outputs = repo.list_by_job("job-1").await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].index, 0);
        assert_eq!(outputs[0].specs, spec);

        let mut first = outputs[0].clone();
        first.fail("encoder crashed", now);
        repo.update(&first).await.unwrap();

        let outputs = repo.list_by_job("job-1").await.unwrap();
        assert_eq!(outputs[0].status, OutputStatus::Failed);
        assert_eq!(
            outputs[0].outcome.as_ref().and_then(|o| o.message.clone()),
            Some("encoder crashed".to_string())
        );

        assert_eq!(repo.delete_by_jobs(&["job-1".to_string()]).await.unwrap(), 2);
    }
}
