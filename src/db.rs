use crate::types::UploadOutcome;
use log::error;
use rusqlite::{params, Connection, Result};
use serde::Serialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// One completed upload cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Spotting {
    pub id: i64,
    pub timestamp: f64,
    pub outcome: String,
    pub plate: Option<String>,
    pub image_path: Option<String>,
}

/// SQLite log of upload cycles.
pub struct History {
    conn: Mutex<Connection>,
}

impl History {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        History::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        History::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS spotting (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                outcome TEXT NOT NULL,
                plate TEXT,
                image_path TEXT
            )",
            [],
        )?;
        Ok(History {
            conn: Mutex::new(conn),
        })
    }

    /// Records a cycle. Database errors are logged, never returned.
    pub async fn record(&self, outcome: &UploadOutcome, image_path: Option<&Path>) {
        let conn = self.conn.lock().await;
        if let Err(e) = record_impl(&conn, outcome, image_path) {
            error!("Error recording upload cycle: {:?}", e);
        }
    }

    /// Most recent cycles first.
    pub async fn recent(&self, limit: usize) -> Vec<Spotting> {
        let conn = self.conn.lock().await;
        match recent_impl(&conn, limit) {
            Ok(rows) => rows,
            Err(e) => {
                error!("Error reading upload history: {:?}", e);
                Vec::new()
            }
        }
    }
}

fn record_impl(conn: &Connection, outcome: &UploadOutcome, image_path: Option<&Path>) -> Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    conn.execute(
        "INSERT INTO spotting(timestamp, outcome, plate, image_path) VALUES (?1, ?2, ?3, ?4)",
        params![
            timestamp,
            outcome.kind().label(),
            outcome.plate(),
            image_path.map(|p| p.to_string_lossy().into_owned()),
        ],
    )?;
    Ok(())
}

fn recent_impl(conn: &Connection, limit: usize) -> Result<Vec<Spotting>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, outcome, plate, image_path FROM spotting ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        Ok(Spotting {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            outcome: row.get(2)?,
            plate: row.get(3)?,
            image_path: row.get(4)?,
        })
    })?;
    rows.collect()
}
