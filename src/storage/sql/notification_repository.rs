//! Unified SQL NotificationRepository implementation.
//!
//! Uses a macro to generate implementations for each SQL backend,
//! eliminating code duplication while maintaining type safety.

use std::marker::PhantomData;

use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{Cond, Condition, ConditionalStatement, Expr};

use super::SqlDatabase;
use crate::notifications::NotificationFilter;
use crate::storage::schema::Notifications;
use crate::storage::{Result, StorageError};

/// SQL-based implementation of NotificationRepository.
///
/// This generic implementation works with any SQL database that implements
/// the `SqlDatabase` trait (PostgreSQL, SQLite).
pub struct SqlNotificationRepository<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlNotificationRepository<DB> {
    /// Create a new SQL notification repository with the given pool.
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &DB::Pool {
        &self.pool
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp {:?}: {}", s, e)))
}

/// WHERE clause for a filter. Empty when the filter is unset.
fn filter_condition(filter: &NotificationFilter) -> Condition {
    let mut cond = Cond::all();
    if let Some(user_id) = &filter.user_id {
        cond = cond.add(Expr::col(Notifications::UserId).eq(user_id.as_str()));
    }
    if let Some(user_ids) = &filter.user_ids {
        cond = cond.add(Expr::col(Notifications::UserId).is_in(user_ids.iter().map(String::as_str)));
    }
    if let Some(category) = filter.category {
        cond = cond.add(Expr::col(Notifications::Category).eq(category.as_str()));
    }
    if let Some(is_read) = filter.is_read {
        cond = cond.add(Expr::col(Notifications::IsRead).eq(is_read));
    }
    cond
}

/// Macro to implement NotificationRepository for a specific SQL backend.
macro_rules! impl_notification_repository {
    ($db_type:ty, $row_type:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        impl SqlNotificationRepository<$db_type> {
            /// Initialize the database schema.
            pub async fn init(&self) -> Result<()> {
                sqlx::raw_sql(crate::storage::schema::CREATE_NOTIFICATIONS_TABLE)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }

            fn from_row(row: &$row_type) -> Result<crate::notifications::Notification> {
                use sqlx::Row;

                let category: String = row.try_get("category")?;
                let created_at: String = row.try_get("created_at")?;
                let updated_at: String = row.try_get("updated_at")?;

                Ok(crate::notifications::Notification {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    category: crate::notifications::Category::parse(&category),
                    content: row.try_get("content")?,
                    is_read: row.try_get("is_read")?,
                    created_at: parse_timestamp(&created_at)?,
                    updated_at: parse_timestamp(&updated_at)?,
                })
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::storage::NotificationRepository for SqlNotificationRepository<$db_type> {
            async fn create(
                &self,
                mut notification: crate::notifications::Notification,
            ) -> Result<crate::notifications::Notification> {
                use sea_query::Query;

                crate::storage::validate(&notification)?;

                let now = Utc::now();
                notification.id = uuid::Uuid::new_v4().to_string();
                notification.created_at = now;
                notification.updated_at = now;

                let stmt = Query::insert()
                    .into_table(Notifications::Table)
                    .columns([
                        Notifications::Id,
                        Notifications::UserId,
                        Notifications::Category,
                        Notifications::Content,
                        Notifications::IsRead,
                        Notifications::CreatedAt,
                        Notifications::UpdatedAt,
                    ])
                    .values_panic([
                        notification.id.as_str().into(),
                        notification.user_id.as_str().into(),
                        notification.category.as_str().into(),
                        notification.content.as_str().into(),
                        notification.is_read.into(),
                        format_timestamp(now).into(),
                        format_timestamp(now).into(),
                    ])
                    .to_owned();

                let sql = <$db_type>::build_insert(stmt);
                sqlx::query(&sql).execute(&self.pool).await?;

                Ok(notification)
            }

            async fn retrieve(&self, id: &str) -> Result<crate::notifications::Notification> {
                use sea_query::Query;

                let stmt = Query::select()
                    .columns(COLUMNS)
                    .from(Notifications::Table)
                    .and_where(Expr::col(Notifications::Id).eq(id))
                    .to_owned();

                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;

                match row {
                    Some(row) => Self::from_row(&row),
                    None => Err(StorageError::NotFound(id.to_string())),
                }
            }

            async fn retrieve_all(
                &self,
                filter: &NotificationFilter,
                page: crate::notifications::Page,
            ) -> Result<crate::notifications::NotificationsPage> {
                use sea_query::{Alias, Asterisk, Func, Order, Query};
                use sqlx::Row;

                let stmt = Query::select()
                    .columns(COLUMNS)
                    .from(Notifications::Table)
                    .cond_where(filter_condition(filter))
                    .order_by(Notifications::CreatedAt, Order::Desc)
                    .order_by(Notifications::Id, Order::Desc)
                    .limit(page.limit)
                    .offset(page.offset)
                    .to_owned();

                let sql = <$db_type>::build_select(stmt);
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                let notifications = rows
                    .iter()
                    .map(Self::from_row)
                    .collect::<Result<Vec<_>>>()?;

                let count = Query::select()
                    .expr_as(Func::count(Expr::col(Asterisk)), Alias::new("total"))
                    .from(Notifications::Table)
                    .cond_where(filter_condition(filter))
                    .to_owned();

                let sql = <$db_type>::build_select(count);
                let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
                let total: i64 = row.try_get("total")?;

                Ok(crate::notifications::NotificationsPage {
                    total: total.max(0) as u64,
                    offset: page.offset,
                    limit: page.limit,
                    notifications,
                })
            }

            async fn read(&self, user_id: &str, id: &str) -> Result<()> {
                use sea_query::Query;

                let stmt = Query::update()
                    .table(Notifications::Table)
                    .values([
                        (Notifications::IsRead, true.into()),
                        (Notifications::UpdatedAt, format_timestamp(Utc::now()).into()),
                    ])
                    .and_where(Expr::col(Notifications::Id).eq(id))
                    .and_where(Expr::col(Notifications::UserId).eq(user_id))
                    .to_owned();

                let sql = <$db_type>::build_update(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                if result.rows_affected() == 0 {
                    return Err(StorageError::NotFound(id.to_string()));
                }
                Ok(())
            }

            async fn read_all(&self, filter: &NotificationFilter) -> Result<u64> {
                use sea_query::Query;

                let stmt = Query::update()
                    .table(Notifications::Table)
                    .values([
                        (Notifications::IsRead, true.into()),
                        (Notifications::UpdatedAt, format_timestamp(Utc::now()).into()),
                    ])
                    .cond_where(filter_condition(filter))
                    .to_owned();

                let sql = <$db_type>::build_update(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected())
            }

            async fn delete(&self, id: &str) -> Result<()> {
                use sea_query::Query;

                let stmt = Query::delete()
                    .from_table(Notifications::Table)
                    .and_where(Expr::col(Notifications::Id).eq(id))
                    .to_owned();

                let sql = <$db_type>::build_delete(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                if result.rows_affected() == 0 {
                    return Err(StorageError::NotFound(id.to_string()));
                }
                Ok(())
            }
        }
    };
}

const COLUMNS: [Notifications; 7] = [
    Notifications::Id,
    Notifications::UserId,
    Notifications::Category,
    Notifications::Content,
    Notifications::IsRead,
    Notifications::CreatedAt,
    Notifications::UpdatedAt,
];

#[cfg(feature = "postgres")]
impl_notification_repository!(super::postgres::Postgres, sqlx::postgres::PgRow, "postgres");

#[cfg(feature = "sqlite")]
impl_notification_repository!(super::sqlite::Sqlite, sqlx::sqlite::SqliteRow, "sqlite");
