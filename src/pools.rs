use std::net::IpAddr;

use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{AccountRow, ProxyRow};
use crate::error::ApiError;
use crate::resolver;
use crate::socks::ProxyKind;
use crate::types::AccountKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProxy {
    pub host: String,
    pub port: u16,
    #[serde(rename = "type", default)]
    pub kind: ProxyKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub max_concurrent: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    #[serde(rename = "type")]
    pub kind: AccountKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub max_concurrent: Option<i32>,
}

/// Outcome of a line-format import; invalid lines are skipped, not fatal.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ImportOutcome {
    pub added: usize,
    pub skipped: usize,
}

fn kind_text(kind: ProxyKind) -> &'static str {
    match kind {
        ProxyKind::Socks4 => "socks4",
        ProxyKind::Socks5 => "socks5",
    }
}

fn account_kind_text(kind: AccountKind) -> &'static str {
    match kind {
        AccountKind::Microsoft => "microsoft",
        AccountKind::Cracked => "cracked",
    }
}

pub async fn list_proxies(pool: &PgPool) -> Result<Vec<ProxyRow>, ApiError> {
    let rows = sqlx::query_as::<_, ProxyRow>("SELECT * FROM proxies ORDER BY host, port")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Insert a proxy. A literal private/reserved host is rejected — scans
/// tunneled through such an endpoint would defeat the SSRF guard.
pub async fn create_proxy(pool: &PgPool, new: NewProxy) -> Result<ProxyRow, ApiError> {
    if new.host.trim().is_empty() {
        return Err(ApiError::Validation("proxy host must not be empty".to_string()));
    }
    if let Ok(ip) = new.host.parse::<IpAddr>() {
        if resolver::is_private_ip(ip) {
            return Err(ApiError::Validation(format!(
                "proxy host {ip} is in a private or reserved range"
            )));
        }
    }
    let max_concurrent = new.max_concurrent.unwrap_or(3).max(1);
    let row = sqlx::query_as::<_, ProxyRow>(
        "INSERT INTO proxies (id, host, port, proxy_type, username, password, max_concurrent) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.host.trim())
    .bind(new.port as i32)
    .bind(kind_text(new.kind))
    .bind(&new.username)
    .bind(&new.password)
    .bind(max_concurrent)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn delete_proxy(pool: &PgPool, id: Uuid) -> Result<(), ApiError> {
    let deleted = sqlx::query("DELETE FROM proxies WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound("proxy"));
    }
    Ok(())
}

/// Parse one `host:port[:user:pass]` import line.
pub fn parse_proxy_line(line: &str) -> Option<(String, u16, Option<String>, Option<String>)> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return None;
    }
    let parts: Vec<&str> = line.split(':').collect();
    let (host, port) = match parts.as_slice() {
        [host, port] | [host, port, _, _] => ((*host).to_string(), port.parse::<u16>().ok()?),
        _ => return None,
    };
    if host.is_empty() || port == 0 {
        return None;
    }
    let (user, pass) = match parts.as_slice() {
        [_, _, user, pass] => (Some((*user).to_string()), Some((*pass).to_string())),
        _ => (None, None),
    };
    Some((host, port, user, pass))
}

/// Bulk import from the line format. Lines that fail to parse or validate
/// count as skipped.
pub async fn import_proxies(
    pool: &PgPool,
    body: &str,
    kind: ProxyKind,
) -> Result<ImportOutcome, ApiError> {
    let mut outcome = ImportOutcome::default();
    for line in body.lines() {
        if line.split('#').next().unwrap_or("").trim().is_empty() {
            continue;
        }
        let Some((host, port, username, password)) = parse_proxy_line(line) else {
            outcome.skipped += 1;
            continue;
        };
        let new = NewProxy {
            host,
            port,
            kind,
            username,
            password,
            max_concurrent: None,
        };
        match create_proxy(pool, new).await {
            Ok(_) => outcome.added += 1,
            Err(ApiError::Validation(_)) => outcome.skipped += 1,
            Err(other) => return Err(other),
        }
    }
    Ok(outcome)
}

pub async fn list_accounts(pool: &PgPool) -> Result<Vec<AccountRow>, ApiError> {
    let rows = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts ORDER BY username")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn create_account(pool: &PgPool, new: NewAccount) -> Result<AccountRow, ApiError> {
    if new.kind == AccountKind::Microsoft && new.access_token.is_none() {
        return Err(ApiError::Validation(
            "microsoft accounts need an access token".to_string(),
        ));
    }
    let max_concurrent = new.max_concurrent.unwrap_or(3).max(1);
    let row = sqlx::query_as::<_, AccountRow>(
        "INSERT INTO accounts (id, account_type, username, access_token, refresh_token, max_concurrent) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(account_kind_text(new.kind))
    .bind(&new.username)
    .bind(&new.access_token)
    .bind(&new.refresh_token)
    .bind(max_concurrent)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn delete_account(pool: &PgPool, id: Uuid) -> Result<(), ApiError> {
    let deleted = sqlx::query("DELETE FROM accounts WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound("account"));
    }
    Ok(())
}

/// Parse one `username[:accessToken[:refreshToken]]` account import line.
/// A token makes it a microsoft account, otherwise cracked.
pub fn parse_account_line(line: &str) -> Option<NewAccount> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return None;
    }
    let mut parts = line.splitn(3, ':');
    let username = parts.next().filter(|u| !u.is_empty())?.to_string();
    let access_token = parts.next().filter(|t| !t.is_empty()).map(str::to_string);
    let refresh_token = parts.next().filter(|t| !t.is_empty()).map(str::to_string);
    let kind = if access_token.is_some() {
        AccountKind::Microsoft
    } else {
        AccountKind::Cracked
    };
    Some(NewAccount {
        kind,
        username: Some(username),
        access_token,
        refresh_token,
        max_concurrent: None,
    })
}

pub async fn import_accounts(pool: &PgPool, body: &str) -> Result<ImportOutcome, ApiError> {
    let mut outcome = ImportOutcome::default();
    for line in body.lines() {
        if line.split('#').next().unwrap_or("").trim().is_empty() {
            continue;
        }
        match parse_account_line(line) {
            Some(new) => match create_account(pool, new).await {
                Ok(_) => outcome.added += 1,
                Err(ApiError::Validation(_)) => outcome.skipped += 1,
                Err(other) => return Err(other),
            },
            None => outcome.skipped += 1,
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_lines() {
        assert_eq!(
            parse_proxy_line("1.2.3.4:1080"),
            Some(("1.2.3.4".to_string(), 1080, None, None))
        );
        assert_eq!(
            parse_proxy_line("proxy.example.com:1080:alice:s3cret"),
            Some((
                "proxy.example.com".to_string(),
                1080,
                Some("alice".to_string()),
                Some("s3cret".to_string())
            ))
        );
        assert_eq!(parse_proxy_line("  # comment only"), None);
        assert_eq!(parse_proxy_line("1.2.3.4"), None);
        assert_eq!(parse_proxy_line("1.2.3.4:notaport"), None);
        assert_eq!(parse_proxy_line("1.2.3.4:1080:user"), None);
    }

    #[test]
    fn account_lines() {
        let cracked = parse_account_line("steve").unwrap();
        assert_eq!(cracked.kind, AccountKind::Cracked);
        assert_eq!(cracked.username.as_deref(), Some("steve"));

        let ms = parse_account_line("alex:eyJtoken:eyJrefresh").unwrap();
        assert_eq!(ms.kind, AccountKind::Microsoft);
        assert_eq!(ms.access_token.as_deref(), Some("eyJtoken"));
        assert_eq!(ms.refresh_token.as_deref(), Some("eyJrefresh"));

        assert!(parse_account_line("").is_none());
        assert!(parse_account_line(":token").is_none());
    }
}
