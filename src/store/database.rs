//! SQLite persistence for chats, messages, tool servers and OAuth state.
//!
//! Uses `rusqlite` in synchronous mode behind a mutex; every call holds the
//! lock only for the duration of its own statements. WAL mode lets the
//! instance host processes open the same file while the chat server runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::errors::StoreError;
use super::types::{
    AuthMode, AuthRequest, AuthRequestStatus, CatalogRow, ImageRecord, ImageTool,
    InstanceRecord, InstanceState, MessageRole, NewMessage, OAuthProvider, Part, StoredMessage,
};

// ─── Store ──────────────────────────────────────────────────────────────────

/// Shared handle to the relational store.
///
/// Constructed once at process start and passed to every component.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Database {
            reason: format!("connection lock poisoned: {e}"),
        })
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS oauth_providers (
                name TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                client_secret TEXT NOT NULL,
                authorization_endpoint TEXT NOT NULL,
                callback_url TEXT NOT NULL,
                scopes TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS oauth_tokens (
                provider TEXT PRIMARY KEY,
                refresh_token TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tool_server_images (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                container_ref TEXT NOT NULL,
                auth_mode TEXT NOT NULL,
                oauth_provider TEXT,
                env_schema TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                UNIQUE (slug, version)
            );

            CREATE TABLE IF NOT EXISTS image_tools (
                image_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                input_schema TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (image_id, name),
                FOREIGN KEY (image_id) REFERENCES tool_server_images(id)
            );

            CREATE TABLE IF NOT EXISTS tool_server_instances (
                id TEXT PRIMARY KEY,
                image_id TEXT NOT NULL,
                env TEXT NOT NULL DEFAULT '{}',
                address TEXT,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (image_id) REFERENCES tool_server_images(id)
            );

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                chat_id TEXT NOT NULL,
                role TEXT NOT NULL,
                stop_reason TEXT,
                auth_request_id TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (chat_id) REFERENCES chats(id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat
                ON messages(chat_id, seq);

            CREATE TABLE IF NOT EXISTS message_parts (
                message_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                kind TEXT NOT NULL,
                text TEXT,
                tool_call_id TEXT,
                tool_name TEXT,
                arguments TEXT,
                call_index INTEGER,
                is_error INTEGER,
                PRIMARY KEY (message_id, position),
                FOREIGN KEY (message_id) REFERENCES messages(id)
            );

            CREATE TABLE IF NOT EXISTS auth_requests (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                instance_id TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                FOREIGN KEY (chat_id) REFERENCES chats(id)
            );

            CREATE INDEX IF NOT EXISTS idx_auth_requests_provider
                ON auth_requests(provider, status);
            ",
        )?;
        Ok(())
    }

    // ─── OAuth ──────────────────────────────────────────────────────────

    /// Insert or replace an OAuth provider.
    pub fn upsert_oauth_provider(&self, provider: &OAuthProvider) -> Result<(), StoreError> {
        let scopes = serde_json::to_string(&provider.scopes)?;
        self.lock()?.execute(
            "INSERT INTO oauth_providers
             (name, client_id, client_secret, authorization_endpoint, callback_url, scopes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                client_id = excluded.client_id,
                client_secret = excluded.client_secret,
                authorization_endpoint = excluded.authorization_endpoint,
                callback_url = excluded.callback_url,
                scopes = excluded.scopes",
            params![
                provider.name,
                provider.client_id,
                provider.client_secret,
                provider.authorization_endpoint,
                provider.callback_url,
                scopes,
            ],
        )?;
        Ok(())
    }

    /// Get an OAuth provider by name.
    pub fn get_oauth_provider(&self, name: &str) -> Result<Option<OAuthProvider>, StoreError> {
        let row = self
            .lock()?
            .query_row(
                "SELECT name, client_id, client_secret, authorization_endpoint, callback_url, scopes
                 FROM oauth_providers WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        OAuthProvider {
                            name: row.get(0)?,
                            client_id: row.get(1)?,
                            client_secret: row.get(2)?,
                            authorization_endpoint: row.get(3)?,
                            callback_url: row.get(4)?,
                            scopes: Vec::new(),
                        },
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((mut provider, scopes)) => {
                provider.scopes = serde_json::from_str(&scopes)?;
                Ok(Some(provider))
            }
            None => Ok(None),
        }
    }

    /// Store the user's refresh token for a provider, replacing any previous one.
    pub fn upsert_oauth_token(&self, provider: &str, refresh_token: &str) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO oauth_tokens (provider, refresh_token, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(provider) DO UPDATE SET
                refresh_token = excluded.refresh_token,
                updated_at = excluded.updated_at",
            params![provider, refresh_token, now()],
        )?;
        Ok(())
    }

    /// Get the stored refresh token for a provider.
    pub fn get_refresh_token(&self, provider: &str) -> Result<Option<String>, StoreError> {
        let token = self
            .lock()?
            .query_row(
                "SELECT refresh_token FROM oauth_tokens WHERE provider = ?1",
                params![provider],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token)
    }

    // ─── Images ─────────────────────────────────────────────────────────

    /// Insert an image together with its tools in one transaction.
    pub fn insert_image(&self, image: &ImageRecord, tools: &[ImageTool]) -> Result<(), StoreError> {
        let env_schema = serde_json::to_string(&image.env_schema)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO tool_server_images
             (id, slug, version, name, container_ref, auth_mode, oauth_provider, env_schema, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                image.id,
                image.slug,
                image.version,
                image.name,
                image.container_ref,
                image.auth_mode.as_str(),
                image.oauth_provider,
                env_schema,
                now(),
            ],
        )?;

        for tool in tools {
            let schema = serde_json::to_string(&tool.input_schema)?;
            tx.execute(
                "INSERT INTO image_tools (image_id, name, description, input_schema)
                 VALUES (?1, ?2, ?3, ?4)",
                params![image.id, tool.name, tool.description, schema],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Get an image by id.
    pub fn get_image(&self, image_id: &str) -> Result<Option<ImageRecord>, StoreError> {
        let row = self
            .lock()?
            .query_row(
                "SELECT id, slug, version, name, container_ref, auth_mode, oauth_provider, env_schema
                 FROM tool_server_images WHERE id = ?1",
                params![image_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, slug, version, name, container_ref, auth_mode, oauth_provider, env)) = row
        else {
            return Ok(None);
        };

        let auth_mode = AuthMode::parse(&auth_mode).ok_or_else(|| StoreError::Decode {
            table: "tool_server_images",
            reason: format!("unknown auth mode '{auth_mode}'"),
        })?;
        let env_schema: BTreeMap<String, String> = serde_json::from_str(&env)?;

        Ok(Some(ImageRecord {
            id,
            slug,
            version,
            name,
            container_ref,
            auth_mode,
            oauth_provider,
            env_schema,
        }))
    }

    /// List the tools advertised by an image, ordered by name.
    pub fn image_tools(&self, image_id: &str) -> Result<Vec<ImageTool>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name, description, input_schema FROM image_tools
             WHERE image_id = ?1 ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![image_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut tools = Vec::new();
        for row in rows {
            let (name, description, schema) = row?;
            tools.push(ImageTool {
                name,
                description,
                input_schema: parse_json_value(&schema),
            });
        }
        Ok(tools)
    }

    // ─── Instances ──────────────────────────────────────────────────────

    /// Persist a new instance record.
    pub fn insert_instance(&self, instance: &InstanceRecord) -> Result<(), StoreError> {
        let env = serde_json::to_string(&instance.env)?;
        self.lock()?.execute(
            "INSERT INTO tool_server_instances (id, image_id, env, address, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                instance.id,
                instance.image_id,
                env,
                instance.address,
                instance.state.as_str(),
                instance.created_at,
            ],
        )?;
        Ok(())
    }

    /// Get an instance by id.
    pub fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        let row = self
            .lock()?
            .query_row(
                "SELECT id, image_id, env, address, state, created_at
                 FROM tool_server_instances WHERE id = ?1",
                params![instance_id],
                instance_row,
            )
            .optional()?;
        row.map(decode_instance).transpose()
    }

    /// List every instance record, oldest first.
    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, image_id, env, address, state, created_at
             FROM tool_server_instances ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], instance_row)?;

        let mut instances = Vec::new();
        for row in rows {
            instances.push(decode_instance(row?)?);
        }
        Ok(instances)
    }

    /// Record the facade address and make the instance visible to the catalog.
    pub fn mark_instance_ready(&self, instance_id: &str, address: &str) -> Result<(), StoreError> {
        let updated = self.lock()?.execute(
            "UPDATE tool_server_instances SET address = ?2, state = 'ready' WHERE id = ?1",
            params![instance_id, address],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "instance",
                id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    /// Mark an instance dead. Missing records are ignored.
    pub fn mark_instance_dead(&self, instance_id: &str) -> Result<(), StoreError> {
        self.lock()?.execute(
            "UPDATE tool_server_instances SET state = 'dead' WHERE id = ?1",
            params![instance_id],
        )?;
        Ok(())
    }

    /// Delete an instance record. Returns whether a row was removed.
    pub fn delete_instance(&self, instance_id: &str) -> Result<bool, StoreError> {
        let deleted = self.lock()?.execute(
            "DELETE FROM tool_server_instances WHERE id = ?1",
            params![instance_id],
        )?;
        Ok(deleted > 0)
    }

    /// Every tool of every ready instance, in stable catalog order.
    pub fn ready_catalog_rows(&self) -> Result<Vec<CatalogRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT i.id, i.address, img.oauth_provider, t.name, t.description, t.input_schema
             FROM tool_server_instances i
             JOIN tool_server_images img ON img.id = i.image_id
             JOIN image_tools t ON t.image_id = i.image_id
             WHERE i.state = 'ready' AND i.address IS NOT NULL
             ORDER BY i.created_at ASC, i.id ASC, t.name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CatalogRow {
                instance_id: row.get(0)?,
                address: row.get(1)?,
                oauth_provider: row.get(2)?,
                tool: ImageTool {
                    name: row.get(3)?,
                    description: row.get(4)?,
                    input_schema: parse_json_value(&row.get::<_, String>(5)?),
                },
            })
        })?;

        let mut catalog = Vec::new();
        for row in rows {
            catalog.push(row?);
        }
        Ok(catalog)
    }

    // ─── Chats ──────────────────────────────────────────────────────────

    /// Create a chat with the given id.
    pub fn create_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO chats (id, created_at) VALUES (?1, ?2)",
            params![chat_id, now()],
        )?;
        Ok(())
    }

    /// Whether a chat exists.
    pub fn chat_exists(&self, chat_id: &str) -> Result<bool, StoreError> {
        let found: Option<String> = self
            .lock()?
            .query_row(
                "SELECT id FROM chats WHERE id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ─── Messages ───────────────────────────────────────────────────────

    /// Insert a message and all of its parts atomically.
    pub fn insert_message(
        &self,
        chat_id: &str,
        msg: &NewMessage,
    ) -> Result<StoredMessage, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let stored = insert_message_in(&tx, chat_id, msg)?;
        tx.commit()?;
        Ok(stored)
    }

    /// All messages of a chat with their parts, in insertion order.
    pub fn get_messages(&self, chat_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, chat_id, role, stop_reason, auth_request_id, created_at
             FROM messages WHERE chat_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, chat_id, role, stop_reason, auth_request_id, created_at) = row?;
            let role = MessageRole::parse(&role).ok_or_else(|| StoreError::Decode {
                table: "messages",
                reason: format!("unknown role '{role}' on message {id}"),
            })?;
            messages.push(StoredMessage {
                id,
                chat_id,
                role,
                parts: Vec::new(),
                auth_request_id,
                stop_reason,
                created_at,
            });
        }

        let mut part_stmt = conn.prepare(
            "SELECT p.message_id, p.kind, p.text, p.tool_call_id, p.tool_name,
                    p.arguments, p.call_index, p.is_error
             FROM message_parts p
             JOIN messages m ON m.id = p.message_id
             WHERE m.chat_id = ?1
             ORDER BY m.seq ASC, p.position ASC",
        )?;
        let part_rows = part_stmt.query_map(params![chat_id], |row| {
            Ok(PartRow {
                message_id: row.get(0)?,
                kind: row.get(1)?,
                text: row.get(2)?,
                tool_call_id: row.get(3)?,
                tool_name: row.get(4)?,
                arguments: row.get(5)?,
                call_index: row.get(6)?,
                is_error: row.get(7)?,
            })
        })?;

        let mut parts_by_message: HashMap<String, Vec<Part>> = HashMap::new();
        for row in part_rows {
            let row = row?;
            let message_id = row.message_id.clone();
            parts_by_message
                .entry(message_id)
                .or_default()
                .push(decode_part(row)?);
        }

        for message in &mut messages {
            if let Some(parts) = parts_by_message.remove(&message.id) {
                message.parts = parts;
            }
        }
        Ok(messages)
    }

    // ─── Auth Requests ──────────────────────────────────────────────────

    /// Open an auth request and insert the system message announcing it,
    /// both in one transaction.
    pub fn insert_auth_interrupt(
        &self,
        chat_id: &str,
        provider: &str,
        instance_id: Option<&str>,
        text: &str,
    ) -> Result<(AuthRequest, StoredMessage), StoreError> {
        let request = AuthRequest {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            provider: provider.to_string(),
            instance_id: instance_id.map(str::to_string),
            status: AuthRequestStatus::Open,
            created_at: now(),
            resolved_at: None,
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO auth_requests (id, chat_id, provider, instance_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                request.id,
                request.chat_id,
                request.provider,
                request.instance_id,
                request.status.as_str(),
                request.created_at,
            ],
        )?;

        let mut msg = NewMessage::system(text);
        msg.auth_request_id = Some(request.id.clone());
        let stored = insert_message_in(&tx, chat_id, &msg)?;

        tx.commit()?;
        Ok((request, stored))
    }

    /// Get an auth request by id.
    pub fn get_auth_request(&self, id: &str) -> Result<Option<AuthRequest>, StoreError> {
        let row = self
            .lock()?
            .query_row(
                "SELECT id, chat_id, provider, instance_id, status, created_at, resolved_at
                 FROM auth_requests WHERE id = ?1",
                params![id],
                auth_request_row,
            )
            .optional()?;
        row.map(decode_auth_request).transpose()
    }

    /// Resolve every open auth request for a provider and return them.
    pub fn resolve_auth_requests(&self, provider: &str) -> Result<Vec<AuthRequest>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut open = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, chat_id, provider, instance_id, status, created_at, resolved_at
                 FROM auth_requests WHERE provider = ?1 AND status = 'open'
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![provider], auth_request_row)?;
            for row in rows {
                open.push(decode_auth_request(row?)?);
            }
        }

        let resolved_at = now();
        tx.execute(
            "UPDATE auth_requests SET status = 'resolved', resolved_at = ?2
             WHERE provider = ?1 AND status = 'open'",
            params![provider, resolved_at],
        )?;
        tx.commit()?;

        for request in &mut open {
            request.status = AuthRequestStatus::Resolved;
            request.resolved_at = Some(resolved_at.clone());
        }
        Ok(open)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn parse_json_value(json: &str) -> serde_json::Value {
    serde_json::from_str(json).unwrap_or(serde_json::Value::Null)
}

/// Insert a message row and its part rows on an open transaction.
fn insert_message_in(
    conn: &Connection,
    chat_id: &str,
    msg: &NewMessage,
) -> Result<StoredMessage, StoreError> {
    let stored = StoredMessage {
        id: Uuid::new_v4().to_string(),
        chat_id: chat_id.to_string(),
        role: msg.role,
        parts: msg.parts.clone(),
        auth_request_id: msg.auth_request_id.clone(),
        stop_reason: msg.stop_reason.clone(),
        created_at: now(),
    };

    conn.execute(
        "INSERT INTO messages (id, chat_id, role, stop_reason, auth_request_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            stored.id,
            stored.chat_id,
            stored.role.as_str(),
            stored.stop_reason,
            stored.auth_request_id,
            stored.created_at,
        ],
    )?;

    for (position, part) in stored.parts.iter().enumerate() {
        let position = position as i64;
        match part {
            Part::Text { content } => conn.execute(
                "INSERT INTO message_parts (message_id, position, kind, text)
                 VALUES (?1, ?2, ?3, ?4)",
                params![stored.id, position, part.kind(), content],
            )?,
            Part::ToolCallRequest {
                id,
                name,
                arguments,
                index,
            } => conn.execute(
                "INSERT INTO message_parts
                 (message_id, position, kind, tool_call_id, tool_name, arguments, call_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![stored.id, position, part.kind(), id, name, arguments, index],
            )?,
            Part::ToolCallResult {
                tool_call_id,
                content,
                is_error,
            } => conn.execute(
                "INSERT INTO message_parts
                 (message_id, position, kind, tool_call_id, text, is_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![stored.id, position, part.kind(), tool_call_id, content, is_error],
            )?,
        };
    }

    Ok(stored)
}

struct PartRow {
    message_id: String,
    kind: String,
    text: Option<String>,
    tool_call_id: Option<String>,
    tool_name: Option<String>,
    arguments: Option<String>,
    call_index: Option<u32>,
    is_error: Option<bool>,
}

fn decode_part(row: PartRow) -> Result<Part, StoreError> {
    let missing = |column: &str| StoreError::Decode {
        table: "message_parts",
        reason: format!(
            "{} part of message {} has no {column}",
            row.kind, row.message_id
        ),
    };

    match row.kind.as_str() {
        "text" => Ok(Part::Text {
            content: row.text.clone().unwrap_or_default(),
        }),
        "tool_call_request" => Ok(Part::ToolCallRequest {
            id: row.tool_call_id.clone().ok_or_else(|| missing("tool_call_id"))?,
            name: row.tool_name.clone().ok_or_else(|| missing("tool_name"))?,
            arguments: row.arguments.clone().unwrap_or_default(),
            index: row.call_index.ok_or_else(|| missing("call_index"))?,
        }),
        "tool_call_result" => Ok(Part::ToolCallResult {
            tool_call_id: row.tool_call_id.clone().ok_or_else(|| missing("tool_call_id"))?,
            content: row.text.clone().unwrap_or_default(),
            is_error: row.is_error.unwrap_or(false),
        }),
        other => Err(StoreError::Decode {
            table: "message_parts",
            reason: format!("unknown part kind '{other}' on message {}", row.message_id),
        }),
    }
}

type InstanceRow = (String, String, String, Option<String>, String, String);

fn instance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_instance(row: InstanceRow) -> Result<InstanceRecord, StoreError> {
    let (id, image_id, env, address, state, created_at) = row;
    let state = InstanceState::parse(&state).ok_or_else(|| StoreError::Decode {
        table: "tool_server_instances",
        reason: format!("unknown state '{state}' on instance {id}"),
    })?;
    Ok(InstanceRecord {
        env: serde_json::from_str(&env)?,
        id,
        image_id,
        address,
        state,
        created_at,
    })
}

type AuthRequestRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
);

fn auth_request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuthRequestRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_auth_request(row: AuthRequestRow) -> Result<AuthRequest, StoreError> {
    let (id, chat_id, provider, instance_id, status, created_at, resolved_at) = row;
    let status = AuthRequestStatus::parse(&status).ok_or_else(|| StoreError::Decode {
        table: "auth_requests",
        reason: format!("unknown status '{status}' on auth request {id}"),
    })?;
    Ok(AuthRequest {
        id,
        chat_id,
        provider,
        instance_id,
        status,
        created_at,
        resolved_at,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
