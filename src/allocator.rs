use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::db::{AccountRow, ProxyRow};

/// One (proxy, account) pair bound to a processing queue item.
#[derive(Debug, Clone)]
pub struct Lease {
    pub proxy: ProxyRow,
    pub account: AccountRow,
}

/// Lease one proxy and one account inside the caller's claim transaction.
///
/// Rows are picked least-recently-used first (`last_used_at NULLS FIRST`)
/// under `FOR UPDATE SKIP LOCKED`, so concurrent claimers never contend on
/// the same row. Returns `None` when either pool is exhausted; the caller
/// must then abort the claim so the queue item stays pending.
pub async fn allocate(tx: &mut Transaction<'_, Postgres>) -> Result<Option<Lease>, sqlx::Error> {
    let proxy = sqlx::query_as::<_, ProxyRow>(
        "SELECT * FROM proxies \
         WHERE is_active AND current_usage < max_concurrent \
         ORDER BY last_used_at ASC NULLS FIRST \
         LIMIT 1 FOR UPDATE SKIP LOCKED",
    )
    .fetch_optional(&mut **tx)
    .await?;
    let Some(mut proxy) = proxy else {
        return Ok(None);
    };

    let account = sqlx::query_as::<_, AccountRow>(
        "SELECT * FROM accounts \
         WHERE is_active AND is_valid AND current_usage < max_concurrent \
         ORDER BY last_used_at ASC NULLS FIRST \
         LIMIT 1 FOR UPDATE SKIP LOCKED",
    )
    .fetch_optional(&mut **tx)
    .await?;
    let Some(mut account) = account else {
        return Ok(None);
    };

    sqlx::query("UPDATE proxies SET current_usage = current_usage + 1, last_used_at = now() WHERE id = $1")
        .bind(proxy.id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("UPDATE accounts SET current_usage = current_usage + 1, last_used_at = now() WHERE id = $1")
        .bind(account.id)
        .execute(&mut **tx)
        .await?;

    proxy.current_usage += 1;
    account.current_usage += 1;
    Ok(Some(Lease { proxy, account }))
}

/// Return a lease. Decrements clamp at zero, so releasing an already-freed
/// pair is a no-op.
pub async fn release(
    tx: &mut Transaction<'_, Postgres>,
    proxy_id: Uuid,
    account_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE proxies SET current_usage = GREATEST(current_usage - 1, 0) WHERE id = $1")
        .bind(proxy_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("UPDATE accounts SET current_usage = GREATEST(current_usage - 1, 0) WHERE id = $1")
        .bind(account_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
