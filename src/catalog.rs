//! The catalog: a single-table relational store mapping
//! `(filename, index, key, peer)` — "chunk `index` of file `filename` has
//! content `key` and is stored on `peer`".
//!
//! Modeled as an external collaborator: the core only ever issues SQL
//! against it and exchanges its whole-file byte image over the wire, the
//! way `SYNC_CATALOG`/`SEND_CATALOG` are specified. The concrete engine is
//! `rusqlite` (bundled SQLite); there is no primary key and no uniqueness
//! constraint, matching the source schema exactly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

/// One row of the `keys` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRow {
    pub filename: String,
    pub index: i64,
    pub key: String,
    pub peer: String,
}

pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    /// Open (creating if needed) the catalog at `path`, ensuring the
    /// `keys` table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .with_context(|| format!("opening catalog at {:?}", path))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS keys (
                filename TEXT NOT NULL,
                num      INTEGER NOT NULL,
                key      TEXT NOT NULL,
                peer     TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { path })
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.path).with_context(|| format!("opening catalog at {:?}", self.path))
    }

    pub fn insert(&self, filename: &str, index: i64, key: &str, peer: &str) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO keys (filename, num, key, peer) VALUES (?1, ?2, ?3, ?4)",
            params![filename, index, key, peer],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete every row for `filename`, returning the `(key, peer)` pairs
    /// that existed beforehand so the caller can notify the affected peers.
    pub fn delete_by_filename(&self, filename: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.connect()?;
        let rows = {
            let mut stmt = conn.prepare("SELECT key, peer FROM keys WHERE filename = ?1")?;
            let rows = stmt
                .query_map(params![filename], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
            rows
        };
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM keys WHERE filename = ?1", params![filename])?;
        tx.commit()?;
        Ok(rows)
    }

    /// All chunks of `filename`, ordered by index.
    pub fn select_chunks(&self, filename: &str) -> Result<Vec<(i64, String, String)>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT num, key, peer FROM keys WHERE filename = ?1 ORDER BY num")?;
        let rows = stmt
            .query_map(params![filename], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<(i64, String, String)>>>()?;
        Ok(rows)
    }

    pub fn select_all_rows(&self) -> Result<Vec<ChunkRow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT filename, num, key, peer FROM keys")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ChunkRow {
                    filename: row.get(0)?,
                    index: row.get(1)?,
                    key: row.get(2)?,
                    peer: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<ChunkRow>>>()?;
        Ok(rows)
    }

    pub fn select_distinct_filenames(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT DISTINCT filename FROM keys")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    /// Number of rows currently placed on `peer`, used for least-loaded
    /// replica placement during upload.
    pub fn count_by_peer(&self, peer: &str) -> Result<i64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM keys WHERE peer = ?1",
            params![peer],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// The whole-file byte image exchanged by `SYNC_CATALOG`/`SEND_CATALOG`.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).with_context(|| format!("reading catalog file {:?}", self.path))
    }

    /// Overwrite the catalog file with a byte image received from a peer.
    /// Written atomically (temp file + rename) so a concurrent reader never
    /// observes a half-written database.
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = dir.to_path_buf();
        tmp.push(format!(
            ".{}.tmp",
            self.path.file_name().unwrap().to_string_lossy()
        ));
        std::fs::write(&tmp, data).with_context(|| format!("writing {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {:?} to {:?}", tmp, self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_select() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("global.db")).unwrap();
        catalog.insert("a.txt", 0, &"a".repeat(40), "p1:1").unwrap();
        catalog.insert("a.txt", 0, &"a".repeat(40), "p2:2").unwrap();

        let chunks = catalog.select_chunks("a.txt").unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].0, 0);

        assert_eq!(catalog.count_by_peer("p1:1").unwrap(), 1);
        assert_eq!(catalog.count_by_peer("p3:3").unwrap(), 0);

        assert_eq!(catalog.select_distinct_filenames().unwrap(), vec!["a.txt"]);
    }

    #[test]
    fn delete_returns_affected_rows() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("global.db")).unwrap();
        catalog.insert("a.txt", 0, &"b".repeat(40), "p1:1").unwrap();

        let rows = catalog.delete_by_filename("a.txt").unwrap();
        assert_eq!(rows, vec![("b".repeat(40), "p1:1".to_string())]);
        assert!(catalog.select_chunks("a.txt").unwrap().is_empty());
    }

    #[test]
    fn byte_image_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("global.db")).unwrap();
        catalog.insert("a.txt", 0, &"c".repeat(40), "p1:1").unwrap();

        let bytes = catalog.read_bytes().unwrap();

        let other = Catalog::open(dir.path().join("other.db")).unwrap();
        other.write_bytes(&bytes).unwrap();
        assert_eq!(other.select_chunks("a.txt").unwrap().len(), 1);
    }
}
