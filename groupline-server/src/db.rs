//! SQLite persistence layer.
//!
//! Stores users, groups, memberships (with admin flag) and message history.
//! Uses WAL mode for concurrent reads during writes.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

use crate::error::PersistError;
use crate::persistence::{Persistence, RemovalOutcome};
use crate::types::{
    ChatMessage, GroupId, GroupMember, GroupMembers, GroupSummary, MessageId, MessageUser, User,
    UserId,
};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS groups (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );

            -- seq orders members by join time; the earliest remaining member
            -- is promoted when the last admin leaves.
            CREATE TABLE IF NOT EXISTS user_groups (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                group_id    TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                is_admin    INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, group_id)
            );

            CREATE INDEX IF NOT EXISTS idx_user_groups_group
                ON user_groups(group_id, seq);

            CREATE TABLE IF NOT EXISTS messages (
                id          TEXT PRIMARY KEY,
                group_id    TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id),
                content     TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_group
                ON messages(group_id, created_at);
            ",
        )?;
        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    pub fn get_user(&self, id: UserId) -> SqlResult<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, username FROM users WHERE id = ?1",
                params![id.to_string()],
                map_user_row,
            )
            .optional()
    }

    pub fn find_user_by_name(&self, username: &str) -> SqlResult<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, username FROM users WHERE username = ?1",
                params![username],
                map_user_row,
            )
            .optional()
    }

    pub fn create_user(&self, username: &str) -> SqlResult<User> {
        let user = User {
            id: UserId::new(),
            username: username.to_string(),
        };
        self.conn.execute(
            "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)",
            params![user.id.to_string(), user.username, Utc::now().timestamp_millis()],
        )?;
        Ok(user)
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Insert a message and return the assigned ID and timestamp.
    /// Timestamps are stored with millisecond precision.
    pub fn insert_message(
        &self,
        user: UserId,
        group: GroupId,
        content: &str,
    ) -> SqlResult<(MessageId, DateTime<Utc>)> {
        let id = MessageId::new();
        let millis = Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO messages (id, group_id, user_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.to_string(), group.to_string(), user.to_string(), content, millis],
        )?;
        Ok((id, millis_to_datetime(millis, 4)?))
    }

    /// Fetch the most recent messages for a group, ordered oldest-first.
    pub fn recent_messages(&self, group: GroupId, limit: usize) -> SqlResult<Vec<ChatMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.content, m.group_id, m.user_id, u.username, m.created_at
             FROM messages m JOIN users u ON u.id = m.user_id
             WHERE m.group_id = ?1
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![group.to_string(), limit as i64], map_message_row)?;
        let mut messages = rows.collect::<SqlResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub fn message_count(&self, group: GroupId) -> SqlResult<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE group_id = ?1",
            params![group.to_string()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    // ── Groups ─────────────────────────────────────────────────────────

    pub fn get_group(&self, group: GroupId) -> SqlResult<Option<GroupSummary>> {
        self.conn
            .query_row(
                "SELECT id, name FROM groups WHERE id = ?1",
                params![group.to_string()],
                map_group_row,
            )
            .optional()
    }

    pub fn groups_for_user(&self, user: UserId) -> SqlResult<Vec<GroupSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT g.id, g.name
             FROM groups g JOIN user_groups ug ON ug.group_id = g.id
             WHERE ug.user_id = ?1
             ORDER BY g.name, g.id",
        )?;
        let rows = stmt.query_map(params![user.to_string()], map_group_row)?;
        rows.collect()
    }

    pub fn all_memberships(&self) -> SqlResult<Vec<GroupMembers>> {
        let mut groups: Vec<GroupMembers> = Vec::new();
        let mut index: HashMap<GroupId, usize> = HashMap::new();

        let mut stmt = self.conn.prepare("SELECT id, name FROM groups ORDER BY id")?;
        for row in stmt.query_map([], map_group_row)? {
            let g = row?;
            index.insert(g.id, groups.len());
            groups.push(GroupMembers {
                id: g.id,
                name: g.name,
                members: Vec::new(),
            });
        }

        let mut stmt = self
            .conn
            .prepare("SELECT group_id, user_id FROM user_groups ORDER BY seq")?;
        let rows = stmt.query_map([], |row| Ok((id_col::<GroupId>(row, 0)?, id_col::<UserId>(row, 1)?)))?;
        for row in rows {
            let (group, user) = row?;
            if let Some(&i) = index.get(&group) {
                groups[i].members.push(user);
            }
        }
        Ok(groups)
    }

    /// Members of a group in join order.
    pub fn group_members(&self, group: GroupId) -> SqlResult<Vec<GroupMember>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.id, u.username, ug.is_admin
             FROM user_groups ug JOIN users u ON u.id = ug.user_id
             WHERE ug.group_id = ?1
             ORDER BY ug.seq",
        )?;
        let rows = stmt.query_map(params![group.to_string()], |row| {
            Ok(GroupMember {
                id: id_col(row, 0)?,
                username: row.get(1)?,
                is_admin: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    /// Create a group with `admin` as its first member.
    pub fn create_group(&mut self, name: &str, admin: UserId) -> SqlResult<GroupSummary> {
        let group = GroupSummary {
            id: GroupId::new(),
            name: name.to_string(),
        };
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO groups (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![group.id.to_string(), group.name, Utc::now().timestamp_millis()],
        )?;
        tx.execute(
            "INSERT INTO user_groups (user_id, group_id, is_admin) VALUES (?1, ?2, 1)",
            params![admin.to_string(), group.id.to_string()],
        )?;
        tx.commit()?;
        Ok(group)
    }

    pub fn add_member(&self, group: GroupId, user: UserId) -> SqlResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO user_groups (user_id, group_id, is_admin) VALUES (?1, ?2, 0)",
            params![user.to_string(), group.to_string()],
        )?;
        Ok(inserted > 0)
    }

    /// Remove a member. In one transaction: promote the earliest remaining
    /// member if no admin is left, or delete the group if nobody is left.
    pub fn remove_member(&mut self, group: GroupId, user: UserId) -> SqlResult<RemovalOutcome> {
        let (g, u) = (group.to_string(), user.to_string());
        let tx = self.conn.transaction()?;

        let removed = tx.execute(
            "DELETE FROM user_groups WHERE group_id = ?1 AND user_id = ?2",
            params![g, u],
        )?;
        if removed == 0 {
            return Ok(RemovalOutcome::NotMember);
        }

        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM user_groups WHERE group_id = ?1",
            params![g],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            tx.execute("DELETE FROM groups WHERE id = ?1", params![g])?;
            tx.commit()?;
            return Ok(RemovalOutcome::GroupDeleted);
        }

        let admins: i64 = tx.query_row(
            "SELECT COUNT(*) FROM user_groups WHERE group_id = ?1 AND is_admin = 1",
            params![g],
            |row| row.get(0),
        )?;
        let mut promoted = None;
        if admins == 0 {
            let (seq, next): (i64, UserId) = tx.query_row(
                "SELECT seq, user_id FROM user_groups WHERE group_id = ?1 ORDER BY seq LIMIT 1",
                params![g],
                |row| Ok((row.get(0)?, id_col(row, 1)?)),
            )?;
            tx.execute("UPDATE user_groups SET is_admin = 1 WHERE seq = ?1", params![seq])?;
            promoted = Some(next);
        }
        tx.commit()?;
        Ok(RemovalOutcome::Removed { promoted })
    }

    pub fn delete_group(&self, group: GroupId) -> SqlResult<bool> {
        let n = self
            .conn
            .execute("DELETE FROM groups WHERE id = ?1", params![group.to_string()])?;
        Ok(n > 0)
    }

    pub fn rename_group(&self, group: GroupId, name: &str) -> SqlResult<bool> {
        let n = self.conn.execute(
            "UPDATE groups SET name = ?2 WHERE id = ?1",
            params![group.to_string(), name],
        )?;
        Ok(n > 0)
    }

    pub fn is_admin(&self, group: GroupId, user: UserId) -> SqlResult<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM user_groups
                           WHERE group_id = ?1 AND user_id = ?2 AND is_admin = 1)",
            params![group.to_string(), user.to_string()],
            |row| row.get(0),
        )
    }

    pub fn is_member(&self, group: GroupId, user: UserId) -> SqlResult<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM user_groups WHERE group_id = ?1 AND user_id = ?2)",
            params![group.to_string(), user.to_string()],
            |row| row.get(0),
        )
    }
}

fn id_col<T>(row: &rusqlite::Row, idx: usize) -> SqlResult<T>
where
    T: FromStr<Err = uuid::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn millis_to_datetime(millis: i64, idx: usize) -> SqlResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn map_user_row(row: &rusqlite::Row) -> SqlResult<User> {
    Ok(User {
        id: id_col(row, 0)?,
        username: row.get(1)?,
    })
}

fn map_group_row(row: &rusqlite::Row) -> SqlResult<GroupSummary> {
    Ok(GroupSummary {
        id: id_col(row, 0)?,
        name: row.get(1)?,
    })
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<ChatMessage> {
    Ok(ChatMessage {
        id: id_col(row, 0)?,
        content: row.get(1)?,
        group_id: id_col(row, 2)?,
        user: MessageUser {
            id: id_col(row, 3)?,
            username: row.get(4)?,
        },
        timestamp: millis_to_datetime(row.get(5)?, 5)?,
    })
}

// ── Persistence adapter ────────────────────────────────────────────────

/// [`Persistence`] over a [`Db`] shared behind a mutex.
pub struct SqlitePersistence {
    db: Mutex<Db>,
}

impl SqlitePersistence {
    pub fn new(db: Db) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        Ok(Self::new(Db::open(path)?))
    }

    pub fn open_memory() -> Result<Self, PersistError> {
        Ok(Self::new(Db::open_memory()?))
    }

    /// Number of stored messages in a group.
    pub fn message_count(&self, group: GroupId) -> Result<usize, PersistError> {
        Ok(self.db.lock().message_count(group)?)
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn get_user(&self, user: UserId) -> Result<Option<User>, PersistError> {
        Ok(self.db.lock().get_user(user)?)
    }

    async fn create_user(&self, username: &str) -> Result<User, PersistError> {
        Ok(self.db.lock().create_user(username)?)
    }

    async fn find_user_by_name(&self, username: &str) -> Result<Option<User>, PersistError> {
        Ok(self.db.lock().find_user_by_name(username)?)
    }

    async fn insert_message(
        &self,
        user: UserId,
        group: GroupId,
        content: &str,
    ) -> Result<(MessageId, DateTime<Utc>), PersistError> {
        Ok(self.db.lock().insert_message(user, group, content)?)
    }

    async fn recent_messages(
        &self,
        group: GroupId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, PersistError> {
        Ok(self.db.lock().recent_messages(group, limit)?)
    }

    async fn groups_for_user(&self, user: UserId) -> Result<Vec<GroupSummary>, PersistError> {
        Ok(self.db.lock().groups_for_user(user)?)
    }

    async fn all_memberships(&self) -> Result<Vec<GroupMembers>, PersistError> {
        Ok(self.db.lock().all_memberships()?)
    }

    async fn group_members(&self, group: GroupId) -> Result<Vec<GroupMember>, PersistError> {
        Ok(self.db.lock().group_members(group)?)
    }

    async fn get_group(&self, group: GroupId) -> Result<Option<GroupSummary>, PersistError> {
        Ok(self.db.lock().get_group(group)?)
    }

    async fn create_group(&self, name: &str, admin: UserId) -> Result<GroupSummary, PersistError> {
        Ok(self.db.lock().create_group(name, admin)?)
    }

    async fn add_member(&self, group: GroupId, user: UserId) -> Result<bool, PersistError> {
        Ok(self.db.lock().add_member(group, user)?)
    }

    async fn remove_member(
        &self,
        group: GroupId,
        user: UserId,
    ) -> Result<RemovalOutcome, PersistError> {
        Ok(self.db.lock().remove_member(group, user)?)
    }

    async fn delete_group(&self, group: GroupId) -> Result<bool, PersistError> {
        Ok(self.db.lock().delete_group(group)?)
    }

    async fn rename_group(&self, group: GroupId, name: &str) -> Result<bool, PersistError> {
        Ok(self.db.lock().rename_group(group, name)?)
    }

    async fn is_admin(&self, group: GroupId, user: UserId) -> Result<bool, PersistError> {
        Ok(self.db.lock().is_admin(group, user)?)
    }

    async fn is_member(&self, group: GroupId, user: UserId) -> Result<bool, PersistError> {
        Ok(self.db.lock().is_member(group, user)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(db: &Db, names: &[&str]) -> Vec<User> {
        names.iter().map(|n| db.create_user(n).unwrap()).collect()
    }

    #[test]
    fn create_group_makes_creator_admin() {
        let mut db = Db::open_memory().unwrap();
        let alice = users(&db, &["alice"]).remove(0);

        let group = db.create_group("general", alice.id).unwrap();

        assert!(db.is_member(group.id, alice.id).unwrap());
        assert!(db.is_admin(group.id, alice.id).unwrap());
        assert_eq!(db.groups_for_user(alice.id).unwrap(), vec![group]);
    }

    #[test]
    fn group_members_in_join_order_with_admin_flag() {
        let mut db = Db::open_memory().unwrap();
        let u = users(&db, &["alice", "bob", "carol"]);
        let group = db.create_group("g", u[1].id).unwrap();
        db.add_member(group.id, u[2].id).unwrap();
        db.add_member(group.id, u[0].id).unwrap();

        let members = db.group_members(group.id).unwrap();
        let names: Vec<_> = members.iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, ["bob", "carol", "alice"]);
        assert_eq!(members.iter().filter(|m| m.is_admin).count(), 1);
        assert!(members[0].is_admin);
        assert!(db.group_members(GroupId::new()).unwrap().is_empty());
    }

    #[test]
    fn add_member_is_idempotent() {
        let mut db = Db::open_memory().unwrap();
        let u = users(&db, &["alice", "bob"]);
        let group = db.create_group("g", u[0].id).unwrap();

        assert!(db.add_member(group.id, u[1].id).unwrap());
        assert!(!db.add_member(group.id, u[1].id).unwrap());
        assert!(!db.is_admin(group.id, u[1].id).unwrap());
    }

    #[test]
    fn last_admin_leaving_promotes_earliest_member() {
        let mut db = Db::open_memory().unwrap();
        let u = users(&db, &["alice", "bob", "carol"]);
        let group = db.create_group("g", u[0].id).unwrap();
        db.add_member(group.id, u[1].id).unwrap();
        db.add_member(group.id, u[2].id).unwrap();

        let outcome = db.remove_member(group.id, u[0].id).unwrap();
        assert_eq!(outcome, RemovalOutcome::Removed { promoted: Some(u[1].id) });
        assert!(db.is_admin(group.id, u[1].id).unwrap());
        assert!(!db.is_admin(group.id, u[2].id).unwrap());

        // A non-admin leaving promotes nobody.
        let outcome = db.remove_member(group.id, u[2].id).unwrap();
        assert_eq!(outcome, RemovalOutcome::Removed { promoted: None });
    }

    #[test]
    fn last_member_leaving_deletes_group() {
        let mut db = Db::open_memory().unwrap();
        let u = users(&db, &["alice"]);
        let group = db.create_group("g", u[0].id).unwrap();
        db.insert_message(u[0].id, group.id, "bye").unwrap();

        assert_eq!(db.remove_member(group.id, u[0].id).unwrap(), RemovalOutcome::GroupDeleted);
        assert!(db.get_group(group.id).unwrap().is_none());
        assert_eq!(db.message_count(group.id).unwrap(), 0);
        assert_eq!(db.remove_member(group.id, u[0].id).unwrap(), RemovalOutcome::NotMember);
    }

    #[test]
    fn recent_messages_oldest_first_with_author() {
        let mut db = Db::open_memory().unwrap();
        let u = users(&db, &["alice"]);
        let group = db.create_group("g", u[0].id).unwrap();
        for i in 0..5 {
            db.insert_message(u[0].id, group.id, &format!("m{i}")).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let msgs = db.recent_messages(group.id, 3).unwrap();
        let contents: Vec<_> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert_eq!(msgs[0].user.username, "alice");
        assert_eq!(msgs[0].group_id, group.id);
    }

    #[test]
    fn insert_message_timestamp_round_trips() {
        let mut db = Db::open_memory().unwrap();
        let u = users(&db, &["alice"]);
        let group = db.create_group("g", u[0].id).unwrap();

        let (id, ts) = db.insert_message(u[0].id, group.id, "hi").unwrap();
        let stored = &db.recent_messages(group.id, 1).unwrap()[0];
        assert_eq!(stored.id, id);
        assert_eq!(stored.timestamp, ts);
    }

    #[test]
    fn message_for_unknown_group_fails() {
        let db = Db::open_memory().unwrap();
        let u = users(&db, &["alice"]);
        assert!(db.insert_message(u[0].id, GroupId::new(), "x").is_err());
    }

    #[test]
    fn all_memberships_lists_every_group() {
        let mut db = Db::open_memory().unwrap();
        let u = users(&db, &["alice", "bob"]);
        let g1 = db.create_group("one", u[0].id).unwrap();
        let g2 = db.create_group("two", u[1].id).unwrap();
        db.add_member(g1.id, u[1].id).unwrap();

        let all = db.all_memberships().unwrap();
        assert_eq!(all.len(), 2);
        let one = all.iter().find(|g| g.id == g1.id).unwrap();
        assert_eq!(one.name, "one");
        assert_eq!(one.members, vec![u[0].id, u[1].id]);
        let two = all.iter().find(|g| g.id == g2.id).unwrap();
        assert_eq!(two.members, vec![u[1].id]);
    }

    #[test]
    fn on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groupline.db");
        let user = {
            let db = Db::open(&path).unwrap();
            db.create_user("alice").unwrap()
        };
        let db = Db::open(&path).unwrap();
        assert_eq!(db.get_user(user.id).unwrap(), Some(user.clone()));
        assert_eq!(db.find_user_by_name("alice").unwrap(), Some(user));
    }
}
