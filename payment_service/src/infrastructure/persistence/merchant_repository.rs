use crate::domain::entities::Merchant;
use crate::domain::error::PaymentError;
use crate::domain::repository::MerchantRepository;
use crate::infrastructure::persistence::models::MerchantModel;
use crate::infrastructure::persistence::{with_deadline, QueryTier};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

pub struct PostgresMerchantRepository {
    pool: PgPool,
}

impl PostgresMerchantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MerchantRepository for PostgresMerchantRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Merchant>, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, MerchantModel>(r#"SELECT * FROM merchants WHERE id = $1"#)
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;

        Ok(model.map(Into::into))
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Merchant>, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, MerchantModel>(r#"SELECT * FROM merchants WHERE slug = $1"#)
                .bind(slug)
                .fetch_optional(&self.pool),
        )
        .await?;

        Ok(model.map(Into::into))
    }
}
