use std::sync::{Arc, Mutex, MutexGuard};

use chrono::SecondsFormat;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::ApiError;
use crate::models::*;

/// Relational store. Typed operations only; business rules live in the
/// service layer. A single writer connection serializes mutations (SQLite),
/// a reader connection serves queries concurrently under WAL.
#[derive(Clone)]
pub struct Db {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Server-assigned timestamps use fixed microsecond precision so that the
/// `(created_at, id)` tuple orders lexicographically in SQL.
pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Generate a session refresh secret: `rfs_<32 hex chars>`
pub fn generate_refresh_secret() -> String {
    format!("rfs_{:032x}", uuid::Uuid::new_v4().as_u128())
}

fn open_connection(path: &str) -> Connection {
    let conn = Connection::open(path).expect("Failed to open database");
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
        .expect("Failed to set pragmas");
    conn
}

impl Db {
    pub fn new(path: &str, search_tokenizer: &str) -> Self {
        Self::open(path, path, search_tokenizer)
    }

    pub fn open(path: &str, reader_path: &str, search_tokenizer: &str) -> Self {
        let db = Db {
            writer: Arc::new(Mutex::new(open_connection(path))),
            reader: Arc::new(Mutex::new(open_connection(reader_path))),
        };
        db.migrate(search_tokenizer);
        db
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self, search_tokenizer: &str) {
        let conn = self.writer();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                handle TEXT NOT NULL UNIQUE,
                credential_hash TEXT NOT NULL,
                display_name TEXT NOT NULL,
                avatar_ref TEXT,
                status TEXT NOT NULL DEFAULT 'offline',
                last_seen_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                refresh_secret TEXT NOT NULL UNIQUE,
                device_id TEXT,
                device_kind TEXT,
                device_label TEXT,
                socket_id TEXT,
                ip_address TEXT,
                user_agent TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                last_activity_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT,
                slug TEXT UNIQUE,
                avatar_ref TEXT,
                owner_id TEXT REFERENCES users(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_message_at TEXT,
                deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS participants (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                joined_at TEXT NOT NULL,
                left_at TEXT,
                last_read_message_id TEXT,
                unread_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(chat_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_participants_user_active
                ON participants(user_id) WHERE left_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_participants_chat_active
                ON participants(chat_id) WHERE left_at IS NULL;

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                sender_id TEXT REFERENCES users(id) ON DELETE SET NULL,
                body TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'text',
                metadata TEXT NOT NULL DEFAULT '{}',
                reply_to_id TEXT,
                edited INTEGER NOT NULL DEFAULT 0,
                edited_at TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_created
                ON messages(chat_id, created_at DESC, id DESC) WHERE deleted = 0;

            CREATE TABLE IF NOT EXISTS message_edits (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                prior_body TEXT NOT NULL,
                prior_metadata TEXT NOT NULL DEFAULT '{}',
                edited_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_message_edits_message ON message_edits(message_id);

            CREATE TABLE IF NOT EXISTS deliveries (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'sent',
                delivered_at TEXT,
                read_at TEXT,
                UNIQUE(message_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_user_pending
                ON deliveries(user_id, status) WHERE status != 'read';

            CREATE TABLE IF NOT EXISTS reactions (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                glyph TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(message_id, user_id, glyph)
            );
            CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(message_id);

            CREATE TABLE IF NOT EXISTS attachments (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                file_name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                original_ref TEXT NOT NULL,
                thumbnail_ref TEXT,
                medium_ref TEXT,
                original_url TEXT NOT NULL,
                thumbnail_url TEXT,
                medium_url TEXT,
                width INTEGER,
                height INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);",
        )
        .expect("Failed to run migrations");

        // FTS5 full-text index over message bodies; tokenizer is configurable.
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                message_id UNINDEXED,
                body,
                tokenize='{search_tokenizer}'
            );"
        ))
        .expect("Failed to create FTS5 table");
    }

    // --- Users ---

    pub fn create_user(
        &self,
        handle: &str,
        credential_hash: &str,
        display_name: &str,
    ) -> Result<User, ApiError> {
        let id = new_id();
        let now = now_ts();
        let conn = self.writer();
        conn.execute(
            "INSERT INTO users (id, handle, credential_hash, display_name, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'offline', ?5, ?5)",
            params![&id, handle, credential_hash, display_name, &now],
        )
        .map_err(|e| match e {
            e if e.to_string().contains("UNIQUE") => {
                ApiError::Conflict(format!("handle '{handle}' is taken"))
            }
            e => ApiError::Internal(e.to_string()),
        })?;
        Ok(User {
            id,
            handle: handle.to_string(),
            display_name: display_name.to_string(),
            avatar_ref: None,
            status: UserStatus::Offline,
            last_seen_at: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn find_user_by_handle(&self, handle: &str) -> Result<Option<UserAuth>, ApiError> {
        let conn = self.reader();
        let row = conn
            .query_row(
                "SELECT id, handle, credential_hash, display_name, avatar_ref, status, last_seen_at, created_at, updated_at
                 FROM users WHERE handle = ?1",
                params![handle],
                |row| {
                    Ok(UserAuth {
                        user: User {
                            id: row.get(0)?,
                            handle: row.get(1)?,
                            display_name: row.get(3)?,
                            avatar_ref: row.get(4)?,
                            status: parse_status(row.get::<_, String>(5)?),
                            last_seen_at: row.get(6)?,
                            created_at: row.get(7)?,
                            updated_at: row.get(8)?,
                        },
                        credential_hash: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_user_by_id(&self, id: &str) -> Result<Option<User>, ApiError> {
        let conn = self.reader();
        let row = conn
            .query_row(
                "SELECT id, handle, display_name, avatar_ref, status, last_seen_at, created_at, updated_at
                 FROM users WHERE id = ?1",
                params![id],
                row_to_user,
            )
            .optional()?;
        Ok(row)
    }

    pub fn search_users_by_handle(&self, prefix: &str, limit: i64) -> Result<Vec<User>, ApiError> {
        let limit = limit.clamp(1, 20);
        // Escape LIKE wildcards in the prefix; handles are alphanumeric
        // anyway, so this is belt only.
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT id, handle, display_name, avatar_ref, status, last_seen_at, created_at, updated_at
             FROM users WHERE handle LIKE ?1 ESCAPE '\\' ORDER BY handle LIMIT ?2",
        )?;
        let users = stmt
            .query_map(params![pattern, limit], row_to_user)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(users)
    }

    pub fn update_user(
        &self,
        user_id: &str,
        display_name: Option<&str>,
        avatar_ref: Option<&str>,
        status: Option<UserStatus>,
    ) -> Result<User, ApiError> {
        let now = now_ts();
        {
            let conn = self.writer();
            let changed = conn.execute(
                "UPDATE users SET
                    display_name = COALESCE(?2, display_name),
                    avatar_ref = COALESCE(?3, avatar_ref),
                    status = COALESCE(?4, status),
                    updated_at = ?5
                 WHERE id = ?1",
                params![user_id, display_name, avatar_ref, status.map(|s| s.as_str()), &now],
            )?;
            if changed == 0 {
                return Err(ApiError::NotFound("user not found".to_string()));
            }
        }
        self.find_user_by_id(user_id)?
            .ok_or_else(|| ApiError::NotFound("user not found".to_string()))
    }

    pub fn update_presence(
        &self,
        user_id: &str,
        status: UserStatus,
        last_seen_at: Option<&str>,
    ) -> Result<(), ApiError> {
        let conn = self.writer();
        conn.execute(
            "UPDATE users SET status = ?2, last_seen_at = COALESCE(?3, last_seen_at), updated_at = ?4
             WHERE id = ?1",
            params![user_id, status.as_str(), last_seen_at, now_ts()],
        )?;
        Ok(())
    }

    /// True if both users hold an active participant row in some common chat.
    pub fn shares_chat_with(&self, a: &str, b: &str) -> Result<bool, ApiError> {
        let conn = self.reader();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM participants p1
             JOIN participants p2 ON p1.chat_id = p2.chat_id
             WHERE p1.user_id = ?1 AND p1.left_at IS NULL
               AND p2.user_id = ?2 AND p2.left_at IS NULL",
            params![a, b],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    // --- Sessions ---

    pub fn create_session(&self, session: &Session) -> Result<(), ApiError> {
        let conn = self.writer();
        conn.execute(
            "INSERT INTO sessions (id, user_id, refresh_secret, device_id, device_kind, device_label,
                                   socket_id, ip_address, user_agent, active, last_activity_at, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &session.id,
                &session.user_id,
                &session.refresh_secret,
                &session.device_id,
                &session.device_kind,
                &session.device_label,
                &session.socket_id,
                &session.ip_address,
                &session.user_agent,
                session.active as i64,
                &session.last_activity_at,
                &session.created_at,
                &session.expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn find_session_by_id(&self, id: &str) -> Result<Option<Session>, ApiError> {
        let conn = self.reader();
        let row = conn
            .query_row(
                &format!("{SESSION_SELECT} WHERE id = ?1"),
                params![id],
                row_to_session,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_session_by_refresh(&self, secret: &str) -> Result<Option<Session>, ApiError> {
        let conn = self.reader();
        let row = conn
            .query_row(
                &format!("{SESSION_SELECT} WHERE refresh_secret = ?1"),
                params![secret],
                row_to_session,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>, ApiError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(&format!(
            "{SESSION_SELECT} WHERE user_id = ?1 AND active = 1 AND expires_at > ?2
             ORDER BY last_activity_at DESC"
        ))?;
        let sessions = stmt
            .query_map(params![user_id, now_ts()], row_to_session)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(sessions)
    }

    pub fn attach_socket(&self, session_id: &str, socket_id: Option<&str>) -> Result<(), ApiError> {
        let conn = self.writer();
        let changed = conn.execute(
            "UPDATE sessions SET socket_id = ?2, last_activity_at = ?3 WHERE id = ?1",
            params![session_id, socket_id, now_ts()],
        )?;
        if changed == 0 {
            return Err(ApiError::NotFound("session not found".to_string()));
        }
        Ok(())
    }

    pub fn deactivate_session(&self, session_id: &str) -> Result<(), ApiError> {
        let conn = self.writer();
        conn.execute(
            "UPDATE sessions SET active = 0, socket_id = NULL WHERE id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    /// Deactivates every session of the user; returns the affected ids so the
    /// cache entries can be evicted.
    pub fn deactivate_all_sessions(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        let conn = self.writer();
        let mut stmt =
            conn.prepare("SELECT id FROM sessions WHERE user_id = ?1 AND active = 1")?;
        let ids: Vec<String> = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        conn.execute(
            "UPDATE sessions SET active = 0, socket_id = NULL WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(ids)
    }

    pub fn extend_session(&self, session_id: &str, new_expiry: &str) -> Result<(), ApiError> {
        let conn = self.writer();
        let changed = conn.execute(
            "UPDATE sessions SET expires_at = ?2, last_activity_at = ?3 WHERE id = ?1 AND active = 1",
            params![session_id, new_expiry, now_ts()],
        )?;
        if changed == 0 {
            return Err(ApiError::NotFound("session not found".to_string()));
        }
        Ok(())
    }

    // --- Chats ---

    /// Idempotent direct-chat creation. The unique slug `direct:{min}:{max}`
    /// makes concurrent creation between the same pair collapse onto one row.
    /// Returns the chat and whether it was created by this call.
    pub fn create_direct_chat(&self, a: &str, b: &str) -> Result<(Chat, bool), ApiError> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let slug = format!("direct:{lo}:{hi}");
        let now = now_ts();
        let id = new_id();

        let mut conn = self.writer();
        let tx = conn.transaction().map_err(ApiError::from)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO chats (id, kind, slug, created_at, updated_at)
             VALUES (?1, 'direct', ?2, ?3, ?3)",
            params![&id, &slug, &now],
        )?;
        if inserted > 0 {
            for user_id in [lo, hi] {
                tx.execute(
                    "INSERT INTO participants (id, chat_id, user_id, role, joined_at)
                     VALUES (?1, ?2, ?3, 'member', ?4)",
                    params![new_id(), &id, user_id, &now],
                )?;
            }
        } else {
            // Lost the race (or the chat pre-existed): make sure both
            // participant rows are active again.
            tx.execute(
                "UPDATE participants SET left_at = NULL
                 WHERE chat_id = (SELECT id FROM chats WHERE slug = ?1) AND left_at IS NOT NULL",
                params![&slug],
            )?;
        }
        let chat = tx.query_row(
            &format!("{CHAT_SELECT} WHERE slug = ?1"),
            params![&slug],
            row_to_chat,
        )?;
        tx.commit().map_err(ApiError::from)?;
        Ok((chat, inserted > 0))
    }

    pub fn find_direct_chat_between(&self, a: &str, b: &str) -> Result<Option<Chat>, ApiError> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let slug = format!("direct:{lo}:{hi}");
        let conn = self.reader();
        let chat = conn
            .query_row(
                &format!("{CHAT_SELECT} WHERE slug = ?1 AND deleted = 0"),
                params![&slug],
                row_to_chat,
            )
            .optional()?;
        Ok(chat)
    }

    /// Creates a group chat with the owner and initial members in one
    /// transaction. Membership size is validated by the caller.
    pub fn create_group_chat(
        &self,
        name: &str,
        owner_id: &str,
        member_ids: &[String],
    ) -> Result<Chat, ApiError> {
        let id = new_id();
        let now = now_ts();
        let mut conn = self.writer();
        let tx = conn.transaction().map_err(ApiError::from)?;
        tx.execute(
            "INSERT INTO chats (id, kind, name, owner_id, created_at, updated_at)
             VALUES (?1, 'group', ?2, ?3, ?4, ?4)",
            params![&id, name, owner_id, &now],
        )?;
        tx.execute(
            "INSERT INTO participants (id, chat_id, user_id, role, joined_at)
             VALUES (?1, ?2, ?3, 'owner', ?4)",
            params![new_id(), &id, owner_id, &now],
        )?;
        for member in member_ids {
            if member == owner_id {
                continue;
            }
            tx.execute(
                "INSERT OR IGNORE INTO participants (id, chat_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, 'member', ?4)",
                params![new_id(), &id, member, &now],
            )?;
        }
        let chat = tx.query_row(&format!("{CHAT_SELECT} WHERE id = ?1"), params![&id], row_to_chat)?;
        tx.commit().map_err(ApiError::from)?;
        Ok(chat)
    }

    pub fn find_chat_by_id(&self, id: &str) -> Result<Option<Chat>, ApiError> {
        let conn = self.reader();
        let chat = conn
            .query_row(&format!("{CHAT_SELECT} WHERE id = ?1"), params![id], row_to_chat)
            .optional()?;
        Ok(chat)
    }

    pub fn update_chat(
        &self,
        chat_id: &str,
        name: Option<&str>,
        avatar_ref: Option<&str>,
    ) -> Result<Chat, ApiError> {
        {
            let conn = self.writer();
            let changed = conn.execute(
                "UPDATE chats SET name = COALESCE(?2, name), avatar_ref = COALESCE(?3, avatar_ref),
                        updated_at = ?4
                 WHERE id = ?1 AND deleted = 0",
                params![chat_id, name, avatar_ref, now_ts()],
            )?;
            if changed == 0 {
                return Err(ApiError::NotFound("chat not found".to_string()));
            }
        }
        self.find_chat_by_id(chat_id)?
            .ok_or_else(|| ApiError::NotFound("chat not found".to_string()))
    }

    pub fn soft_delete_chat(&self, chat_id: &str) -> Result<(), ApiError> {
        let conn = self.writer();
        let changed = conn.execute(
            "UPDATE chats SET deleted = 1, updated_at = ?2 WHERE id = ?1 AND deleted = 0",
            params![chat_id, now_ts()],
        )?;
        if changed == 0 {
            return Err(ApiError::NotFound("chat not found".to_string()));
        }
        Ok(())
    }

    /// Every chat the user actively participates in, joined with the unread
    /// counter and the latest visible message, in a single query.
    pub fn list_user_chats(&self, user_id: &str) -> Result<Vec<ChatSummary>, ApiError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.kind, c.name, c.slug, c.avatar_ref, c.owner_id, c.created_at,
                    c.updated_at, c.last_message_at, c.deleted,
                    p.unread_count,
                    lm.id, lm.chat_id, lm.sender_id, lm.body, lm.kind, lm.metadata, lm.reply_to_id,
                    lm.edited, lm.edited_at, lm.deleted, lm.deleted_at, lm.created_at
             FROM chats c
             JOIN participants p ON p.chat_id = c.id AND p.user_id = ?1 AND p.left_at IS NULL
             LEFT JOIN messages lm ON lm.id = (
                 SELECT id FROM messages
                 WHERE chat_id = c.id AND deleted = 0
                 ORDER BY created_at DESC, id DESC LIMIT 1
             )
             WHERE c.deleted = 0
             ORDER BY COALESCE(c.last_message_at, c.created_at) DESC",
        )?;
        let chats = stmt
            .query_map(params![user_id], |row| {
                let chat = row_to_chat(row)?;
                let unread_count: i64 = row.get(10)?;
                let last_message = match row.get::<_, Option<String>>(11)? {
                    Some(id) => Some(Message {
                        id,
                        chat_id: row.get(12)?,
                        sender_id: row.get(13)?,
                        body: row.get(14)?,
                        kind: parse_message_kind(row.get::<_, String>(15)?),
                        metadata: parse_json(row.get::<_, String>(16)?),
                        reply_to_id: row.get(17)?,
                        edited: row.get::<_, i64>(18)? != 0,
                        edited_at: row.get(19)?,
                        deleted: row.get::<_, i64>(20)? != 0,
                        deleted_at: row.get(21)?,
                        created_at: row.get(22)?,
                    }),
                    None => None,
                };
                Ok(ChatSummary { chat, unread_count, last_message })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(chats)
    }

    // --- Participants ---

    /// Adds users to a chat inside one transaction, enforcing the size cap
    /// with a `count + insert` under the writer lock. Users with a previous
    /// membership are re-activated with a fresh `joined_at`. Already-active
    /// users are skipped. Returns the users actually added.
    pub fn add_participants(
        &self,
        chat_id: &str,
        user_ids: &[String],
        cap: usize,
    ) -> Result<Vec<String>, ApiError> {
        let now = now_ts();
        let mut conn = self.writer();
        let tx = conn.transaction().map_err(ApiError::from)?;

        let active: i64 = tx.query_row(
            "SELECT COUNT(*) FROM participants WHERE chat_id = ?1 AND left_at IS NULL",
            params![chat_id],
            |r| r.get(0),
        )?;

        let mut to_add: Vec<&String> = Vec::new();
        for user_id in user_ids {
            let already: i64 = tx.query_row(
                "SELECT COUNT(*) FROM participants
                 WHERE chat_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                params![chat_id, user_id],
                |r| r.get(0),
            )?;
            if already == 0 && !to_add.contains(&user_id) {
                to_add.push(user_id);
            }
        }

        if active as usize + to_add.len() > cap {
            return Err(ApiError::Conflict(format!(
                "chat would exceed {cap} participants"
            )));
        }

        let mut added = Vec::with_capacity(to_add.len());
        for user_id in to_add {
            let rejoined = tx.execute(
                "UPDATE participants
                 SET left_at = NULL, joined_at = ?3, role = 'member', unread_count = 0,
                     last_read_message_id = NULL
                 WHERE chat_id = ?1 AND user_id = ?2 AND left_at IS NOT NULL",
                params![chat_id, user_id, &now],
            )?;
            if rejoined == 0 {
                tx.execute(
                    "INSERT INTO participants (id, chat_id, user_id, role, joined_at)
                     VALUES (?1, ?2, ?3, 'member', ?4)",
                    params![new_id(), chat_id, user_id, &now],
                )?;
            }
            added.push(user_id.clone());
        }
        tx.commit().map_err(ApiError::from)?;
        Ok(added)
    }

    /// Marks the membership as left. The row is kept so historical messages
    /// and deliveries stay attributable.
    pub fn remove_participant(&self, chat_id: &str, user_id: &str) -> Result<(), ApiError> {
        let conn = self.writer();
        let changed = conn.execute(
            "UPDATE participants SET left_at = ?3
             WHERE chat_id = ?1 AND user_id = ?2 AND left_at IS NULL",
            params![chat_id, user_id, now_ts()],
        )?;
        if changed == 0 {
            return Err(ApiError::NotFound("not a participant".to_string()));
        }
        Ok(())
    }

    pub fn list_active_participant_ids(&self, chat_id: &str) -> Result<Vec<String>, ApiError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM participants WHERE chat_id = ?1 AND left_at IS NULL",
        )?;
        let ids = stmt
            .query_map(params![chat_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn list_active_participants(&self, chat_id: &str) -> Result<Vec<Participant>, ApiError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, user_id, role, joined_at, left_at, last_read_message_id, unread_count
             FROM participants WHERE chat_id = ?1 AND left_at IS NULL ORDER BY joined_at",
        )?;
        let rows = stmt
            .query_map(params![chat_id], row_to_participant)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn is_active_participant(&self, chat_id: &str, user_id: &str) -> Result<bool, ApiError> {
        let conn = self.reader();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM participants
             WHERE chat_id = ?1 AND user_id = ?2 AND left_at IS NULL",
            params![chat_id, user_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn count_active_participants(&self, chat_id: &str) -> Result<i64, ApiError> {
        let conn = self.reader();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM participants WHERE chat_id = ?1 AND left_at IS NULL",
            params![chat_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    pub fn participant_role(&self, chat_id: &str, user_id: &str) -> Result<Option<Role>, ApiError> {
        let conn = self.reader();
        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM participants
                 WHERE chat_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                params![chat_id, user_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(role.and_then(|r| Role::parse(&r)))
    }

    /// Chat ids the user is an active participant of; drives gateway room
    /// membership.
    pub fn list_user_chat_ids(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT p.chat_id FROM participants p
             JOIN chats c ON c.id = p.chat_id AND c.deleted = 0
             WHERE p.user_id = ?1 AND p.left_at IS NULL",
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    // --- Messages ---

    /// Persists a message and its fan-out bookkeeping atomically: the message
    /// row, one delivery row per recipient, attachment rows, the chat's
    /// `last_message_at`, and the recipients' unread counters.
    #[allow(clippy::too_many_arguments)]
    pub fn persist_message(
        &self,
        chat_id: &str,
        sender_id: Option<&str>,
        body: &str,
        kind: MessageKind,
        metadata: serde_json::Value,
        reply_to_id: Option<&str>,
        recipients: &[String],
        attachments: &[AttachmentDescriptor],
    ) -> Result<Message, ApiError> {
        let id = new_id();
        let now = now_ts();
        let metadata_str =
            serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_string());

        let mut conn = self.writer();
        let tx = conn.transaction().map_err(ApiError::from)?;
        tx.execute(
            "INSERT INTO messages (id, chat_id, sender_id, body, kind, metadata, reply_to_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![&id, chat_id, sender_id, body, kind.as_str(), &metadata_str, reply_to_id, &now],
        )?;
        for recipient in recipients {
            tx.execute(
                "INSERT INTO deliveries (id, message_id, user_id, status) VALUES (?1, ?2, ?3, 'sent')",
                params![new_id(), &id, recipient],
            )?;
            tx.execute(
                "UPDATE participants SET unread_count = unread_count + 1
                 WHERE chat_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                params![chat_id, recipient],
            )?;
        }
        for a in attachments {
            tx.execute(
                "INSERT INTO attachments (id, message_id, file_name, mime_type, byte_size,
                        original_ref, thumbnail_ref, medium_ref, original_url, thumbnail_url,
                        medium_url, width, height, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    new_id(),
                    &id,
                    &a.file_name,
                    &a.mime_type,
                    a.byte_size,
                    &a.original_ref,
                    &a.thumbnail_ref,
                    &a.medium_ref,
                    &a.original_url,
                    &a.thumbnail_url,
                    &a.medium_url,
                    a.width,
                    a.height,
                    &now,
                ],
            )?;
        }
        tx.execute(
            "UPDATE chats SET last_message_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![chat_id, &now],
        )?;
        tx.execute(
            "INSERT INTO messages_fts (message_id, body) VALUES (?1, ?2)",
            params![&id, body],
        )?;
        tx.commit().map_err(ApiError::from)?;

        Ok(Message {
            id,
            chat_id: chat_id.to_string(),
            sender_id: sender_id.map(String::from),
            body: body.to_string(),
            kind,
            metadata,
            reply_to_id: reply_to_id.map(String::from),
            edited: false,
            edited_at: None,
            deleted: false,
            deleted_at: None,
            created_at: now,
        })
    }

    pub fn find_message_by_id(&self, id: &str) -> Result<Option<Message>, ApiError> {
        let conn = self.reader();
        let msg = conn
            .query_row(&format!("{MESSAGE_SELECT} WHERE id = ?1"), params![id], row_to_message)
            .optional()?;
        Ok(msg)
    }

    /// Appends the prior body to the edit audit trail and swaps in the new
    /// one. Authorization (sender-only, not deleted) is the service's job.
    pub fn edit_message(&self, message_id: &str, new_body: &str) -> Result<Message, ApiError> {
        let now = now_ts();
        let mut conn = self.writer();
        let tx = conn.transaction().map_err(ApiError::from)?;
        let (prior_body, prior_metadata): (String, String) = tx.query_row(
            "SELECT body, metadata FROM messages WHERE id = ?1 AND deleted = 0",
            params![message_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        tx.execute(
            "INSERT INTO message_edits (id, message_id, prior_body, prior_metadata, edited_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![new_id(), message_id, &prior_body, &prior_metadata, &now],
        )?;
        tx.execute(
            "UPDATE messages SET body = ?2, edited = 1, edited_at = ?3 WHERE id = ?1",
            params![message_id, new_body, &now],
        )?;
        tx.execute(
            "DELETE FROM messages_fts WHERE message_id = ?1",
            params![message_id],
        )?;
        tx.execute(
            "INSERT INTO messages_fts (message_id, body) VALUES (?1, ?2)",
            params![message_id, new_body],
        )?;
        let msg = tx.query_row(
            &format!("{MESSAGE_SELECT} WHERE id = ?1"),
            params![message_id],
            row_to_message,
        )?;
        tx.commit().map_err(ApiError::from)?;
        Ok(msg)
    }

    /// Soft delete: the body becomes the tombstone, delivery rows persist.
    pub fn soft_delete_message(&self, message_id: &str) -> Result<Message, ApiError> {
        let now = now_ts();
        let mut conn = self.writer();
        let tx = conn.transaction().map_err(ApiError::from)?;
        let changed = tx.execute(
            "UPDATE messages SET deleted = 1, deleted_at = ?2, body = ?3 WHERE id = ?1 AND deleted = 0",
            params![message_id, &now, TOMBSTONE],
        )?;
        if changed == 0 {
            return Err(ApiError::NotFound("message not found".to_string()));
        }
        tx.execute(
            "DELETE FROM messages_fts WHERE message_id = ?1",
            params![message_id],
        )?;
        let msg = tx.query_row(
            &format!("{MESSAGE_SELECT} WHERE id = ?1"),
            params![message_id],
            row_to_message,
        )?;
        tx.commit().map_err(ApiError::from)?;
        Ok(msg)
    }

    /// Reverse-chronological page ordered by `(created_at, id)`; the cursor
    /// is the tuple of the last returned row.
    pub fn list_messages_by_chat(
        &self,
        chat_id: &str,
        limit: i64,
        cursor: Option<(&str, &str)>,
    ) -> Result<Vec<Message>, ApiError> {
        let limit = limit.clamp(1, 100);
        let conn = self.reader();
        let messages = match cursor {
            Some((created_at, id)) => {
                let mut stmt = conn.prepare(&format!(
                    "{MESSAGE_SELECT} WHERE chat_id = ?1
                       AND (created_at < ?2 OR (created_at = ?2 AND id < ?3))
                     ORDER BY created_at DESC, id DESC LIMIT ?4"
                ))?;
                let rows = stmt
                    .query_map(params![chat_id, created_at, id, limit], row_to_message)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{MESSAGE_SELECT} WHERE chat_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![chat_id, limit], row_to_message)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
        };
        Ok(messages)
    }

    pub fn list_edit_entries(&self, message_id: &str) -> Result<Vec<EditEntry>, ApiError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, prior_body, prior_metadata, edited_at
             FROM message_edits WHERE message_id = ?1 ORDER BY edited_at",
        )?;
        let rows = stmt
            .query_map(params![message_id], |row| {
                Ok(EditEntry {
                    id: row.get(0)?,
                    message_id: row.get(1)?,
                    prior_body: row.get(2)?,
                    prior_metadata: parse_json(row.get::<_, String>(3)?),
                    edited_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // --- Deliveries ---

    /// Applies a delivery transition, rejecting regressions
    /// (sent < delivered < read, monotonic only).
    pub fn set_delivery_status(
        &self,
        message_id: &str,
        user_id: &str,
        status: DeliveryStatus,
    ) -> Result<(), ApiError> {
        let now = now_ts();
        let conn = self.writer();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM deliveries WHERE message_id = ?1 AND user_id = ?2",
                params![message_id, user_id],
                |r| r.get(0),
            )
            .optional()?;
        let current = match current {
            Some(s) => parse_delivery_status(s),
            None => return Err(ApiError::NotFound("delivery not found".to_string())),
        };
        if current.rank() >= status.rank() {
            return Err(ApiError::Conflict(format!(
                "delivery already {}",
                current.as_str()
            )));
        }
        conn.execute(
            "UPDATE deliveries SET status = ?3,
                    delivered_at = CASE WHEN ?3 = 'delivered' THEN ?4 ELSE delivered_at END,
                    read_at = CASE WHEN ?3 = 'read' THEN ?4 ELSE read_at END
             WHERE message_id = ?1 AND user_id = ?2",
            params![message_id, user_id, status.as_str(), &now],
        )?;
        Ok(())
    }

    /// Flips a delivery row to `delivered` only if it is still `sent`.
    /// Returns whether the row changed; duplicate jobs are a no-op.
    pub fn mark_delivered_if_sent(&self, message_id: &str, user_id: &str) -> Result<bool, ApiError> {
        let conn = self.writer();
        let changed = conn.execute(
            "UPDATE deliveries SET status = 'delivered', delivered_at = ?3
             WHERE message_id = ?1 AND user_id = ?2 AND status = 'sent'",
            params![message_id, user_id, now_ts()],
        )?;
        Ok(changed > 0)
    }

    pub fn deliveries_for_message(&self, message_id: &str) -> Result<Vec<Delivery>, ApiError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, user_id, status, delivered_at, read_at
             FROM deliveries WHERE message_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![message_id], row_to_delivery)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn has_delivery(&self, message_id: &str, user_id: &str) -> Result<bool, ApiError> {
        let conn = self.reader();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM deliveries WHERE message_id = ?1 AND user_id = ?2",
            params![message_id, user_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Recipients of a message whose delivery row is still `sent`.
    pub fn pending_recipients(&self, message_id: &str) -> Result<Vec<String>, ApiError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM deliveries WHERE message_id = ?1 AND status = 'sent'",
        )?;
        let rows = stmt
            .query_map(params![message_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Undelivered messages for a reconnecting user, oldest first, bounded.
    pub fn undelivered_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, ApiError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.chat_id, m.sender_id, m.body, m.kind, m.metadata, m.reply_to_id,
                    m.edited, m.edited_at, m.deleted, m.deleted_at, m.created_at
             FROM deliveries d
             JOIN messages m ON m.id = d.message_id
             WHERE d.user_id = ?1 AND d.status = 'sent' AND m.deleted = 0
             ORDER BY m.created_at ASC, m.id ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit.clamp(1, 100)], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Marks a single message read for the caller. Returns the message's
    /// sender (for the receipt event) and whether the row changed.
    pub fn mark_read(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<(bool, String, Option<String>), ApiError> {
        let now = now_ts();
        let mut conn = self.writer();
        let tx = conn.transaction().map_err(ApiError::from)?;
        let row = tx
            .query_row(
                "SELECT d.status, m.chat_id, m.sender_id
                 FROM deliveries d JOIN messages m ON m.id = d.message_id
                 WHERE d.message_id = ?1 AND d.user_id = ?2",
                params![message_id, user_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        let (status, chat_id, sender_id) = match row {
            Some(r) => r,
            None => return Err(ApiError::NotFound("delivery not found".to_string())),
        };
        if parse_delivery_status(status).rank() >= DeliveryStatus::Read.rank() {
            tx.commit().map_err(ApiError::from)?;
            return Ok((false, chat_id, sender_id));
        }
        tx.execute(
            "UPDATE deliveries SET status = 'read',
                    delivered_at = COALESCE(delivered_at, ?3), read_at = ?3
             WHERE message_id = ?1 AND user_id = ?2",
            params![message_id, user_id, &now],
        )?;
        tx.execute(
            "UPDATE participants SET
                unread_count = (
                    SELECT COUNT(*) FROM deliveries d
                    JOIN messages m ON m.id = d.message_id
                    WHERE d.user_id = ?2 AND m.chat_id = ?1 AND d.status != 'read'
                ),
                last_read_message_id = CASE
                    WHEN last_read_message_id IS NULL THEN ?3
                    WHEN (SELECT created_at || '|' || id FROM messages WHERE id = last_read_message_id)
                       < (SELECT created_at || '|' || id FROM messages WHERE id = ?3) THEN ?3
                    ELSE last_read_message_id
                END
             WHERE chat_id = ?1 AND user_id = ?2",
            params![&chat_id, user_id, message_id],
        )?;
        tx.commit().map_err(ApiError::from)?;
        Ok((true, chat_id, sender_id))
    }

    /// Marks every delivery in the chat up to (and including) the cutoff
    /// message as read, atomically with the participant counters. With no
    /// cutoff the whole chat is read. Returns `(message_id, sender_id)`
    /// pairs of the rows that changed, for receipt events.
    pub fn bulk_mark_read(
        &self,
        chat_id: &str,
        user_id: &str,
        up_to_message_id: Option<&str>,
    ) -> Result<Vec<(String, Option<String>)>, ApiError> {
        let now = now_ts();
        let mut conn = self.writer();
        let tx = conn.transaction().map_err(ApiError::from)?;

        let cutoff: Option<(String, String)> = match up_to_message_id {
            Some(mid) => Some(
                tx.query_row(
                    "SELECT created_at, id FROM messages WHERE id = ?1 AND chat_id = ?2",
                    params![mid, chat_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .map_err(|_| ApiError::NotFound("message not found".to_string()))?,
            ),
            None => None,
        };

        let (range_sql, range_params): (&str, Vec<&dyn rusqlite::types::ToSql>) = match &cutoff {
            Some((ts, id)) => (
                "SELECT d.message_id, m.sender_id
                 FROM deliveries d JOIN messages m ON m.id = d.message_id
                 WHERE m.chat_id = ?1 AND d.user_id = ?2 AND d.status != 'read'
                   AND (m.created_at < ?3 OR (m.created_at = ?3 AND m.id <= ?4))",
                vec![&chat_id as &dyn rusqlite::types::ToSql, &user_id, ts, id],
            ),
            None => (
                "SELECT d.message_id, m.sender_id
                 FROM deliveries d JOIN messages m ON m.id = d.message_id
                 WHERE m.chat_id = ?1 AND d.user_id = ?2 AND d.status != 'read'",
                vec![&chat_id as &dyn rusqlite::types::ToSql, &user_id],
            ),
        };

        let mut stmt = tx.prepare(range_sql)?;
        let affected: Vec<(String, Option<String>)> = stmt
            .query_map(range_params.as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        for (message_id, _) in &affected {
            tx.execute(
                "UPDATE deliveries SET status = 'read',
                        delivered_at = COALESCE(delivered_at, ?3), read_at = ?3
                 WHERE message_id = ?1 AND user_id = ?2",
                params![message_id, user_id, &now],
            )?;
        }

        let last_read = match (&cutoff, affected.last()) {
            (Some((_, id)), _) => Some(id.clone()),
            (None, Some((id, _))) => Some(id.clone()),
            (None, None) => None,
        };
        tx.execute(
            "UPDATE participants SET
                unread_count = (
                    SELECT COUNT(*) FROM deliveries d
                    JOIN messages m ON m.id = d.message_id
                    WHERE d.user_id = ?2 AND m.chat_id = ?1 AND d.status != 'read'
                ),
                last_read_message_id = COALESCE(?3, last_read_message_id)
             WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id, user_id, last_read],
        )?;
        tx.commit().map_err(ApiError::from)?;
        Ok(affected)
    }

    pub fn reset_unread(&self, chat_id: &str, user_id: &str) -> Result<(), ApiError> {
        let conn = self.writer();
        conn.execute(
            "UPDATE participants SET unread_count = 0 WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id, user_id],
        )?;
        Ok(())
    }

    /// Delivery jobs for messages whose rows are still `sent` after the grace
    /// window, used by the reconciliation sweep to replace lost stream
    /// entries. Age is bounded to the last 24 hours.
    pub fn stale_sent_messages(
        &self,
        grace_secs: i64,
        limit: i64,
    ) -> Result<Vec<(String, String, Vec<String>)>, ApiError> {
        let newest = (chrono::Utc::now() - chrono::Duration::seconds(grace_secs))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let oldest = (chrono::Utc::now() - chrono::Duration::hours(24))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT m.id, m.chat_id FROM deliveries d
             JOIN messages m ON m.id = d.message_id
             WHERE d.status = 'sent' AND m.deleted = 0
               AND m.created_at > ?1 AND m.created_at < ?2
             ORDER BY m.created_at ASC LIMIT ?3",
        )?;
        let heads: Vec<(String, String)> = stmt
            .query_map(params![oldest, newest, limit.clamp(1, 1000)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let mut jobs = Vec::with_capacity(heads.len());
        for (message_id, chat_id) in heads {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM deliveries WHERE message_id = ?1 AND status = 'sent'",
            )?;
            let recipients: Vec<String> = stmt
                .query_map(params![&message_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            jobs.push((message_id, chat_id, recipients));
        }
        Ok(jobs)
    }

    /// Test-only clock control for sweep logic.
    #[cfg(test)]
    pub(crate) fn backdate_message_for_tests(&self, message_id: &str, created_at: &str) {
        let conn = self.writer();
        conn.execute(
            "UPDATE messages SET created_at = ?2 WHERE id = ?1",
            params![message_id, created_at],
        )
        .unwrap();
    }

    // --- Reactions ---

    pub fn add_reaction(
        &self,
        message_id: &str,
        chat_id: &str,
        user_id: &str,
        glyph: &str,
    ) -> Result<Reaction, ApiError> {
        let id = new_id();
        let now = now_ts();
        let conn = self.writer();
        conn.execute(
            "INSERT INTO reactions (id, message_id, user_id, glyph, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![&id, message_id, user_id, glyph, &now],
        )
        .map_err(|e| match e {
            e if e.to_string().contains("UNIQUE") => {
                ApiError::Conflict("reaction already exists".to_string())
            }
            e => ApiError::Internal(e.to_string()),
        })?;
        Ok(Reaction {
            id,
            message_id: message_id.to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            glyph: glyph.to_string(),
            created_at: now,
        })
    }

    pub fn find_reaction(&self, reaction_id: &str) -> Result<Option<Reaction>, ApiError> {
        let conn = self.reader();
        let row = conn
            .query_row(
                "SELECT r.id, r.message_id, m.chat_id, r.user_id, r.glyph, r.created_at
                 FROM reactions r JOIN messages m ON m.id = r.message_id
                 WHERE r.id = ?1",
                params![reaction_id],
                |row| {
                    Ok(Reaction {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        chat_id: row.get(2)?,
                        user_id: row.get(3)?,
                        glyph: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn remove_reaction(&self, reaction_id: &str) -> Result<(), ApiError> {
        let conn = self.writer();
        let changed = conn.execute("DELETE FROM reactions WHERE id = ?1", params![reaction_id])?;
        if changed == 0 {
            return Err(ApiError::NotFound("reaction not found".to_string()));
        }
        Ok(())
    }

    pub fn list_reactions(&self, message_id: &str) -> Result<Vec<Reaction>, ApiError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.message_id, m.chat_id, r.user_id, r.glyph, r.created_at
             FROM reactions r JOIN messages m ON m.id = r.message_id
             WHERE r.message_id = ?1 ORDER BY r.created_at",
        )?;
        let rows = stmt
            .query_map(params![message_id], |row| {
                Ok(Reaction {
                    id: row.get(0)?,
                    message_id: row.get(1)?,
                    chat_id: row.get(2)?,
                    user_id: row.get(3)?,
                    glyph: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // --- Search ---

    /// Full-text search restricted to chats the caller actively participates
    /// in. Ranked by FTS relevance, ties broken by recency.
    pub fn full_text_search(
        &self,
        user_id: &str,
        query: &str,
        chat_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SearchHit>, ApiError> {
        let match_expr = fts_quote(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.clamp(1, 100);
        let conn = self.reader();

        let mut sql = String::from(
            "SELECT m.id, m.chat_id, m.sender_id, m.body, m.kind, m.metadata, m.reply_to_id,
                    m.edited, m.edited_at, m.deleted, m.deleted_at, m.created_at,
                    c.name, bm25(messages_fts) AS rank
             FROM messages_fts
             JOIN messages m ON m.id = messages_fts.message_id
             JOIN chats c ON c.id = m.chat_id
             WHERE messages_fts MATCH ?1 AND m.deleted = 0
               AND m.chat_id IN (
                   SELECT chat_id FROM participants WHERE user_id = ?2 AND left_at IS NULL
               )",
        );
        let mut param_values: Vec<String> = vec![match_expr, user_id.to_string()];
        if let Some(chat) = chat_id {
            sql.push_str(" AND m.chat_id = ?3");
            param_values.push(chat.to_string());
        }
        sql.push_str(&format!(
            " ORDER BY rank, m.created_at DESC LIMIT ?{}",
            param_values.len() + 1
        ));
        param_values.push(limit.to_string());

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values
            .iter()
            .map(|v| v as &dyn rusqlite::types::ToSql)
            .collect();
        let hits = stmt
            .query_map(params_refs.as_slice(), |row| {
                Ok(SearchHit {
                    message: row_to_message(row)?,
                    chat_name: row.get(12)?,
                    rank: row.get(13)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(hits)
    }
}

// --- Row mapping ---

const CHAT_SELECT: &str = "SELECT id, kind, name, slug, avatar_ref, owner_id, created_at, \
                           updated_at, last_message_at, deleted FROM chats";

const MESSAGE_SELECT: &str = "SELECT id, chat_id, sender_id, body, kind, metadata, reply_to_id, \
                              edited, edited_at, deleted, deleted_at, created_at FROM messages";

const SESSION_SELECT: &str = "SELECT id, user_id, refresh_secret, device_id, device_kind, \
                              device_label, socket_id, ip_address, user_agent, active, \
                              last_activity_at, created_at, expires_at FROM sessions";

fn parse_json(s: String) -> serde_json::Value {
    serde_json::from_str(&s).unwrap_or_else(|_| serde_json::json!({}))
}

fn parse_status(s: String) -> UserStatus {
    UserStatus::parse(&s).unwrap_or(UserStatus::Offline)
}

fn parse_message_kind(s: String) -> MessageKind {
    MessageKind::parse(&s).unwrap_or(MessageKind::Text)
}

fn parse_delivery_status(s: String) -> DeliveryStatus {
    DeliveryStatus::parse(&s).unwrap_or(DeliveryStatus::Sent)
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        handle: row.get(1)?,
        display_name: row.get(2)?,
        avatar_ref: row.get(3)?,
        status: parse_status(row.get::<_, String>(4)?),
        last_seen_at: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        refresh_secret: row.get(2)?,
        device_id: row.get(3)?,
        device_kind: row.get(4)?,
        device_label: row.get(5)?,
        socket_id: row.get(6)?,
        ip_address: row.get(7)?,
        user_agent: row.get(8)?,
        active: row.get::<_, i64>(9)? != 0,
        last_activity_at: row.get(10)?,
        created_at: row.get(11)?,
        expires_at: row.get(12)?,
    })
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        kind: ChatKind::parse(&row.get::<_, String>(1)?).unwrap_or(ChatKind::Group),
        name: row.get(2)?,
        slug: row.get(3)?,
        avatar_ref: row.get(4)?,
        owner_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        last_message_at: row.get(8)?,
        deleted: row.get::<_, i64>(9)? != 0,
    })
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        role: Role::parse(&row.get::<_, String>(3)?).unwrap_or(Role::Member),
        joined_at: row.get(4)?,
        left_at: row.get(5)?,
        last_read_message_id: row.get(6)?,
        unread_count: row.get(7)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        body: row.get(3)?,
        kind: parse_message_kind(row.get::<_, String>(4)?),
        metadata: parse_json(row.get::<_, String>(5)?),
        reply_to_id: row.get(6)?,
        edited: row.get::<_, i64>(7)? != 0,
        edited_at: row.get(8)?,
        deleted: row.get::<_, i64>(9)? != 0,
        deleted_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<Delivery> {
    Ok(Delivery {
        id: row.get(0)?,
        message_id: row.get(1)?,
        user_id: row.get(2)?,
        status: parse_delivery_status(row.get::<_, String>(3)?),
        delivered_at: row.get(4)?,
        read_at: row.get(5)?,
    })
}

/// Quote each term so user input cannot inject FTS5 query syntax.
fn fts_quote(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
