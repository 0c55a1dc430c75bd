use rusqlite::{params, Connection, Result};
use std::str::FromStr;
use waddle_core::types::ProviderKind;

/// A configured upstream backend, as stored in SQLite. The registry
/// turns each enabled row into a typed handle.
#[derive(Debug, Clone)]
pub struct ProviderLink {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint_url: String,
    pub api_key: Option<String>,
    /// Advertised models. Empty means "accepts any model".
    pub model_list: Vec<String>,
    pub timeout_secs: u64,
    pub enabled: bool,
    pub created_at: String,
}

/// Initialise the provider link table. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS provider_links (
            id           TEXT PRIMARY KEY NOT NULL,
            name         TEXT NOT NULL UNIQUE,
            kind         TEXT NOT NULL,
            endpoint_url TEXT NOT NULL,
            api_key      TEXT,
            model_list   TEXT NOT NULL DEFAULT '[]',  -- JSON array
            timeout_secs INTEGER NOT NULL DEFAULT 120,
            enabled      INTEGER NOT NULL DEFAULT 1,
            created_at   TEXT NOT NULL
        );",
    )
}

fn row_to_link(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderLink> {
    let kind_str: String = row.get(2)?;
    let kind = ProviderKind::from_str(&kind_str).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown provider kind: {}", kind_str).into(),
        )
    })?;
    let models: Vec<String> = serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
    Ok(ProviderLink {
        id: row.get(0)?,
        name: row.get(1)?,
        kind,
        endpoint_url: row.get(3)?,
        api_key: row.get(4)?,
        model_list: models,
        timeout_secs: row.get(6)?,
        enabled: row.get::<_, i32>(7)? != 0,
        created_at: row.get(8)?,
    })
}

const LINK_SELECT_SQL: &str = "SELECT id, name, kind, endpoint_url, api_key, model_list, \
     timeout_secs, enabled, created_at FROM provider_links";

pub fn list_enabled_links(conn: &Connection) -> Result<Vec<ProviderLink>> {
    let sql = format!("{} WHERE enabled = 1 ORDER BY id", LINK_SELECT_SQL);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_link)?;
    rows.collect()
}

/// Register a new upstream link. Id is generated here.
pub fn insert_link(
    conn: &Connection,
    name: &str,
    kind: ProviderKind,
    endpoint_url: &str,
    api_key: Option<&str>,
    model_list: &[String],
) -> Result<ProviderLink> {
    let link = ProviderLink {
        id: uuid::Uuid::now_v7().to_string(),
        name: name.to_string(),
        kind,
        endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
        api_key: api_key.map(str::to_string),
        model_list: model_list.to_vec(),
        timeout_secs: 120,
        enabled: true,
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO provider_links (id, name, kind, endpoint_url, api_key, model_list,
             timeout_secs, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
        params![
            link.id,
            link.name,
            link.kind.to_string(),
            link.endpoint_url,
            link.api_key,
            serde_json::to_string(&link.model_list).unwrap_or_else(|_| "[]".to_string()),
            link.timeout_secs,
            link.created_at
        ],
    )?;
    Ok(link)
}

pub fn set_link_enabled(conn: &Connection, link_id: &str, enabled: bool) -> Result<usize> {
    conn.execute(
        "UPDATE provider_links SET enabled=?2 WHERE id=?1",
        params![link_id, enabled as i32],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_list_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        insert_link(
            &conn,
            "local-ollama",
            ProviderKind::Ollama,
            "http://localhost:11434/",
            None,
            &["llama2".to_string()],
        )
        .unwrap();

        let links = list_enabled_links(&conn).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].kind, ProviderKind::Ollama);
        // Trailing slash trimmed at insert time.
        assert_eq!(links[0].endpoint_url, "http://localhost:11434");
        assert_eq!(links[0].model_list, vec!["llama2"]);
    }

    #[test]
    fn disabled_links_are_not_listed() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let link = insert_link(&conn, "a", ProviderKind::OpenAi, "https://x", Some("k"), &[])
            .unwrap();
        set_link_enabled(&conn, &link.id, false).unwrap();
        assert!(list_enabled_links(&conn).unwrap().is_empty());
    }
}
