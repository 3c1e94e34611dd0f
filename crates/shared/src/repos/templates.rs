use crate::prompts::{PromptTemplate, validate_body};

use super::{Store, StoreError};

impl Store {
    /// Mirrors the in-code template catalog into the insert-only
    /// `prompt_templates` table. Existing rows are never touched; a wording
    /// change must arrive under a fresh id.
    pub async fn seed_prompt_templates(
        &self,
        templates: &[PromptTemplate],
    ) -> Result<(), StoreError> {
        for template in templates {
            validate_body(template.body)
                .map_err(|err| StoreError::InvalidData(err.to_string()))?;

            sqlx::query(
                "INSERT INTO prompt_templates (id, body, category)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(template.id)
            .bind(template.body)
            .bind(template.category)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
