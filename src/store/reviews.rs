//! Query functions for the `code_reviews` table.

use crate::{models::CodeReview, Result};
use sqlx::sqlite::SqlitePool;

const REVIEW_COLUMNS: &str = "id, task_id, reviewer_tier, quality_score, findings, \
     has_syntax_errors, tokens_in, tokens_out, cost, status, created_at";

pub async fn insert_review(pool: &SqlitePool, review: &CodeReview) -> Result<()> {
    sqlx::query(
        "INSERT INTO code_reviews (id, task_id, reviewer_tier, quality_score, findings, \
         has_syntax_errors, tokens_in, tokens_out, cost, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&review.id)
    .bind(&review.task_id)
    .bind(review.reviewer_tier)
    .bind(review.quality_score)
    .bind(&review.findings)
    .bind(review.has_syntax_errors)
    .bind(review.tokens_in)
    .bind(review.tokens_out)
    .bind(review.cost)
    .bind(review.status)
    .bind(review.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_reviews_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<CodeReview>> {
    let reviews = sqlx::query_as::<_, CodeReview>(&format!(
        "SELECT {REVIEW_COLUMNS} FROM code_reviews WHERE task_id = ? ORDER BY created_at ASC"
    ))
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(reviews)
}
