//! SeaORM-backed account store.
//!
//! Enabled with the `seaorm-store` feature. Persists account records, webhook
//! idempotency markers and cancellation feedback to any database SeaORM
//! supports. Concurrency control uses conditional UPDATEs filtered on the
//! stored `version` column, so compare-and-save needs no row locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::{NotSet, Set},
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};

use crate::account::{AccountRecord, BillingInterval, Plan};
use crate::error::{Result, TollgateError};
use crate::storage::{AccountStore, CancellationFeedback};

mod entity {
    pub mod account {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollgate_accounts")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            pub plan: String,
            pub is_lifetime_free: bool,
            pub trial_duration_days: i32,
            pub trial_start_date: Option<DateTimeWithTimeZone>,
            pub trial_end_date: Option<DateTimeWithTimeZone>,
            pub has_used_trial: bool,
            pub subscription_id: Option<String>,
            pub customer_id: Option<String>,
            pub billing_interval: Option<String>,
            pub pending_interval: Option<String>,
            pub subscription_start_date: Option<DateTimeWithTimeZone>,
            pub cancel_at_period_end: bool,
            pub last_downgrade_date: Option<DateTimeWithTimeZone>,
            pub deletion_scheduled_date: Option<DateTimeWithTimeZone>,
            pub deletion_warning_sent: bool,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
            pub version: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod processed_event {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollgate_processed_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_id: String,
            pub processed_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod feedback {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollgate_cancellation_feedback")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i64,
            pub user_id: String,
            pub reason: String,
            pub additional_feedback: Option<String>,
            pub submitted_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

// Saturating conversions between domain integers and column types. The
// database schema is the narrower side; values out of range clamp rather
// than abort a query.

#[inline]
fn db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

#[inline]
fn domain_version(version: i64) -> u64 {
    u64::try_from(version).unwrap_or(0)
}

#[inline]
fn db_trial_days(days: u32) -> i32 {
    i32::try_from(days).unwrap_or(i32::MAX)
}

#[inline]
fn domain_trial_days(days: i32) -> u32 {
    u32::try_from(days).unwrap_or(0)
}

fn parse_plan(value: &str) -> Result<Plan> {
    match value {
        "free" => Ok(Plan::Free),
        "premium" => Ok(Plan::Premium),
        other => Err(TollgateError::Database(format!(
            "unknown plan '{other}' in accounts table"
        ))),
    }
}

fn parse_interval(value: &str) -> Result<BillingInterval> {
    BillingInterval::from_str(value).ok_or_else(|| {
        TollgateError::Database(format!("unknown billing interval '{value}' in accounts table"))
    })
}

fn utc(value: DateTimeWithTimeZone) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}

fn account_record_from_model(model: entity::account::Model) -> Result<AccountRecord> {
    Ok(AccountRecord {
        plan: parse_plan(&model.plan)?,
        billing_interval: model.billing_interval.as_deref().map(parse_interval).transpose()?,
        pending_interval: model.pending_interval.as_deref().map(parse_interval).transpose()?,
        user_id: model.user_id,
        is_lifetime_free: model.is_lifetime_free,
        trial_duration_days: domain_trial_days(model.trial_duration_days),
        trial_start_date: model.trial_start_date.map(utc),
        trial_end_date: model.trial_end_date.map(utc),
        has_used_trial: model.has_used_trial,
        subscription_id: model.subscription_id,
        customer_id: model.customer_id,
        subscription_start_date: model.subscription_start_date.map(utc),
        cancel_at_period_end: model.cancel_at_period_end,
        last_downgrade_date: model.last_downgrade_date.map(utc),
        deletion_scheduled_date: model.deletion_scheduled_date.map(utc),
        deletion_warning_sent: model.deletion_warning_sent,
        created_at: utc(model.created_at),
        updated_at: utc(model.updated_at),
        version: domain_version(model.version),
    })
}

fn account_active_model(record: &AccountRecord) -> entity::account::ActiveModel {
    entity::account::ActiveModel {
        user_id: Set(record.user_id.clone()),
        plan: Set(record.plan.as_str().to_string()),
        is_lifetime_free: Set(record.is_lifetime_free),
        trial_duration_days: Set(db_trial_days(record.trial_duration_days)),
        trial_start_date: Set(record.trial_start_date.map(Into::into)),
        trial_end_date: Set(record.trial_end_date.map(Into::into)),
        has_used_trial: Set(record.has_used_trial),
        subscription_id: Set(record.subscription_id.clone()),
        customer_id: Set(record.customer_id.clone()),
        billing_interval: Set(record.billing_interval.map(|i| i.as_str().to_string())),
        pending_interval: Set(record.pending_interval.map(|i| i.as_str().to_string())),
        subscription_start_date: Set(record.subscription_start_date.map(Into::into)),
        cancel_at_period_end: Set(record.cancel_at_period_end),
        last_downgrade_date: Set(record.last_downgrade_date.map(Into::into)),
        deletion_scheduled_date: Set(record.deletion_scheduled_date.map(Into::into)),
        deletion_warning_sent: Set(record.deletion_warning_sent),
        created_at: Set(record.created_at.into()),
        updated_at: Set(record.updated_at.into()),
        version: Set(db_version(record.version)),
    }
}

/// Conditional UPDATE carrying every mutable column, guarded on the stored
/// version. Zero rows affected means either a conflict or a missing row;
/// the caller distinguishes the two.
fn account_cas_update(
    record: &AccountRecord,
    expected_version: i64,
) -> sea_orm::UpdateMany<entity::account::Entity> {
    use entity::account::{Column, Entity};

    Entity::update_many()
        .col_expr(Column::Plan, Expr::value(record.plan.as_str()))
        .col_expr(Column::IsLifetimeFree, Expr::value(record.is_lifetime_free))
        .col_expr(
            Column::TrialDurationDays,
            Expr::value(db_trial_days(record.trial_duration_days)),
        )
        .col_expr(
            Column::TrialStartDate,
            Expr::value(record.trial_start_date.map(DateTimeWithTimeZone::from)),
        )
        .col_expr(
            Column::TrialEndDate,
            Expr::value(record.trial_end_date.map(DateTimeWithTimeZone::from)),
        )
        .col_expr(Column::HasUsedTrial, Expr::value(record.has_used_trial))
        .col_expr(Column::SubscriptionId, Expr::value(record.subscription_id.clone()))
        .col_expr(Column::CustomerId, Expr::value(record.customer_id.clone()))
        .col_expr(
            Column::BillingInterval,
            Expr::value(record.billing_interval.map(|i| i.as_str().to_string())),
        )
        .col_expr(
            Column::PendingInterval,
            Expr::value(record.pending_interval.map(|i| i.as_str().to_string())),
        )
        .col_expr(
            Column::SubscriptionStartDate,
            Expr::value(record.subscription_start_date.map(DateTimeWithTimeZone::from)),
        )
        .col_expr(Column::CancelAtPeriodEnd, Expr::value(record.cancel_at_period_end))
        .col_expr(
            Column::LastDowngradeDate,
            Expr::value(record.last_downgrade_date.map(DateTimeWithTimeZone::from)),
        )
        .col_expr(
            Column::DeletionScheduledDate,
            Expr::value(record.deletion_scheduled_date.map(DateTimeWithTimeZone::from)),
        )
        .col_expr(Column::DeletionWarningSent, Expr::value(record.deletion_warning_sent))
        .col_expr(Column::UpdatedAt, Expr::value(DateTimeWithTimeZone::from(Utc::now())))
        .col_expr(Column::Version, Expr::value(expected_version.saturating_add(1)))
        .filter(Column::UserId.eq(record.user_id.as_str()))
        .filter(Column::Version.eq(expected_version))
}

/// Account store backed by SeaORM.
///
/// ```rust,ignore
/// let db = sea_orm::Database::connect("postgres://...").await?;
/// let store = SeaOrmAccountStore::new(db);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct SeaOrmAccountStore {
    db: DatabaseConnection,
}

impl SeaOrmAccountStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// The underlying connection, for schema tooling and tests.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create the backing tables when they do not exist yet.
    ///
    /// Convenience for tests and small deployments; larger setups run their
    /// own migrations against the same schema.
    pub async fn ensure_schema(&self) -> Result<()> {
        let backend = self.db.get_database_backend();
        let schema = sea_orm::Schema::new(backend);
        for mut table in [
            schema.create_table_from_entity(entity::account::Entity),
            schema.create_table_from_entity(entity::processed_event::Entity),
            schema.create_table_from_entity(entity::feedback::Entity),
        ] {
            table.if_not_exists();
            self.db.execute(backend.build(&table)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for SeaOrmAccountStore {
    async fn get_account(&self, user_id: &str) -> Result<Option<AccountRecord>> {
        entity::account::Entity::find_by_id(user_id.to_string())
            .one(&self.db)
            .await?
            .map(account_record_from_model)
            .transpose()
    }

    async fn save_account(&self, record: &AccountRecord) -> Result<()> {
        use entity::account::Column;

        record.validate()?;
        let mut active = account_active_model(record);
        active.version = Set(db_version(record.version).saturating_add(1));
        active.updated_at = Set(Utc::now().into());

        // On conflict the version bumps from the stored row, not from the
        // caller's copy, so a blind save never rewinds the counter.
        entity::account::Entity::insert(active)
            .on_conflict(
                OnConflict::column(Column::UserId)
                    .update_columns([
                        Column::Plan,
                        Column::IsLifetimeFree,
                        Column::TrialDurationDays,
                        Column::TrialStartDate,
                        Column::TrialEndDate,
                        Column::HasUsedTrial,
                        Column::SubscriptionId,
                        Column::CustomerId,
                        Column::BillingInterval,
                        Column::PendingInterval,
                        Column::SubscriptionStartDate,
                        Column::CancelAtPeriodEnd,
                        Column::LastDowngradeDate,
                        Column::DeletionScheduledDate,
                        Column::DeletionWarningSent,
                        Column::UpdatedAt,
                    ])
                    .value(Column::Version, Expr::col(Column::Version).add(1))
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        tracing::debug!(
            target: "tollgate::storage",
            user_id = %record.user_id,
            "saved account"
        );
        Ok(())
    }

    async fn compare_and_save_account(
        &self,
        record: &AccountRecord,
        expected_version: u64,
    ) -> Result<bool> {
        record.validate()?;
        let expected = db_version(expected_version);
        let txn = self.db.begin().await?;

        let updated = account_cas_update(record, expected).exec(&txn).await?;
        if updated.rows_affected > 0 {
            txn.commit().await?;
            return Ok(true);
        }

        let exists = entity::account::Entity::find_by_id(record.user_id.clone())
            .one(&txn)
            .await?
            .is_some();
        if exists {
            txn.rollback().await?;
            tracing::debug!(
                target: "tollgate::storage",
                user_id = %record.user_id,
                expected_version,
                "compare_and_save version conflict"
            );
            return Ok(false);
        }

        // Missing record saves unconditionally.
        let mut active = account_active_model(record);
        active.version = Set(expected.saturating_add(1));
        active.updated_at = Set(Utc::now().into());
        entity::account::Entity::insert(active).exec(&txn).await?;
        txn.commit().await?;
        Ok(true)
    }

    async fn get_or_create_account(
        &self,
        user_id: &str,
        trial_duration_days: u32,
    ) -> Result<AccountRecord> {
        use entity::account::Column;

        if let Some(record) = self.get_account(user_id).await? {
            return Ok(record);
        }

        let record = AccountRecord::new(user_id, trial_duration_days);
        let mut active = account_active_model(&record);
        active.version = Set(1);
        let _ = entity::account::Entity::insert(active)
            .on_conflict(OnConflict::column(Column::UserId).do_nothing().to_owned())
            .do_nothing()
            .exec(&self.db)
            .await?;

        // A concurrent registration may have won the insert; either way the
        // row exists now.
        self.get_account(user_id).await?.ok_or_else(|| {
            TollgateError::Database(format!("account row for '{user_id}' missing after insert"))
        })
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> Result<Option<AccountRecord>> {
        entity::account::Entity::find()
            .filter(entity::account::Column::CustomerId.eq(customer_id))
            .one(&self.db)
            .await?
            .map(account_record_from_model)
            .transpose()
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<AccountRecord>> {
        entity::account::Entity::find()
            .filter(entity::account::Column::SubscriptionId.eq(subscription_id))
            .one(&self.db)
            .await?
            .map(account_record_from_model)
            .transpose()
    }

    async fn try_claim_trial(&self, user_id: &str, start: DateTime<Utc>) -> Result<bool> {
        use entity::account::Column;

        let Some(record) = self.get_account(user_id).await? else {
            return Ok(false);
        };
        if record.has_used_trial {
            return Ok(false);
        }
        let end = record.trial_end_for(start);

        // The flag is re-checked in the WHERE clause; a concurrent claim
        // affects zero rows.
        let result = entity::account::Entity::update_many()
            .col_expr(
                Column::TrialStartDate,
                Expr::value(Some(DateTimeWithTimeZone::from(start))),
            )
            .col_expr(
                Column::TrialEndDate,
                Expr::value(Some(DateTimeWithTimeZone::from(end))),
            )
            .col_expr(Column::HasUsedTrial, Expr::value(true))
            .col_expr(Column::UpdatedAt, Expr::value(DateTimeWithTimeZone::from(Utc::now())))
            .col_expr(Column::Version, Expr::col(Column::Version).add(1))
            .filter(Column::UserId.eq(user_id))
            .filter(Column::HasUsedTrial.eq(false))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        Ok(entity::processed_event::Entity::find_by_id(event_id.to_string())
            .one(&self.db)
            .await?
            .is_some())
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        use entity::processed_event::{ActiveModel, Column, Entity};

        let active = ActiveModel {
            event_id: Set(event_id.to_string()),
            processed_at: Set(Utc::now().into()),
        };
        // Replays keep the original timestamp.
        let _ = Entity::insert(active)
            .on_conflict(OnConflict::column(Column::EventId).do_nothing().to_owned())
            .do_nothing()
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let result = entity::processed_event::Entity::delete_many()
            .filter(entity::processed_event::Column::ProcessedAt.lt(DateTimeWithTimeZone::from(cutoff)))
            .exec(&self.db)
            .await?;

        let removed = usize::try_from(result.rows_affected).unwrap_or(usize::MAX);
        if removed > 0 {
            tracing::debug!(
                target: "tollgate::storage",
                removed,
                older_than_days,
                "cleaned up processed webhook events"
            );
        }
        Ok(removed)
    }

    async fn record_feedback(&self, feedback: &CancellationFeedback) -> Result<()> {
        let active = entity::feedback::ActiveModel {
            id: NotSet,
            user_id: Set(feedback.user_id.clone()),
            reason: Set(feedback.reason.clone()),
            additional_feedback: Set(feedback.additional_feedback.clone()),
            submitted_at: Set(feedback.submitted_at.into()),
        };
        entity::feedback::Entity::insert(active).exec(&self.db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> entity::account::Model {
        let created: DateTime<Utc> = "2025-01-10T00:00:00Z".parse().unwrap();
        entity::account::Model {
            user_id: "user_1".to_string(),
            plan: "premium".to_string(),
            is_lifetime_free: false,
            trial_duration_days: 7,
            trial_start_date: Some(created.into()),
            trial_end_date: Some((created + chrono::Duration::days(7)).into()),
            has_used_trial: true,
            subscription_id: Some("sub_123".to_string()),
            customer_id: Some("cus_123".to_string()),
            billing_interval: Some("monthly".to_string()),
            pending_interval: None,
            subscription_start_date: Some(created.into()),
            cancel_at_period_end: false,
            last_downgrade_date: None,
            deletion_scheduled_date: None,
            deletion_warning_sent: false,
            created_at: created.into(),
            updated_at: created.into(),
            version: 3,
        }
    }

    #[test]
    fn model_converts_to_a_record() {
        let record = account_record_from_model(sample_model()).unwrap();
        assert_eq!(record.user_id, "user_1");
        assert_eq!(record.plan, Plan::Premium);
        assert_eq!(record.billing_interval, Some(BillingInterval::Monthly));
        assert_eq!(record.trial_duration_days, 7);
        assert!(record.has_used_trial);
        assert_eq!(record.version, 3);
    }

    #[test]
    fn record_converts_to_an_active_model() {
        let record = account_record_from_model(sample_model()).unwrap();
        let active = account_active_model(&record);
        assert_eq!(active.user_id, Set("user_1".to_string()));
        assert_eq!(active.plan, Set("premium".to_string()));
        assert_eq!(active.billing_interval, Set(Some("monthly".to_string())));
        assert_eq!(active.version, Set(3));
    }

    #[test]
    fn unknown_plan_value_is_rejected() {
        let mut model = sample_model();
        model.plan = "gold".to_string();
        let err = account_record_from_model(model).unwrap_err();
        assert!(err.to_string().contains("unknown plan"));
    }

    #[test]
    fn unknown_interval_value_is_rejected() {
        let mut model = sample_model();
        model.billing_interval = Some("weekly".to_string());
        let err = account_record_from_model(model).unwrap_err();
        assert!(err.to_string().contains("unknown billing interval"));
    }

    #[test]
    fn version_conversions_saturate() {
        assert_eq!(db_version(3), 3);
        assert_eq!(db_version(u64::MAX), i64::MAX);
        assert_eq!(domain_version(-1), 0);
        assert_eq!(domain_trial_days(-5), 0);
        assert_eq!(db_trial_days(u32::MAX), i32::MAX);
    }
}
