/*
 * cdb.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Bastione, an SMTP server and client suite.
 *
 * Bastione is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Bastione is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Bastione.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Read-only lookups in a constant database (the qmail `users/cdb` format):
//! a 2048-byte table of 256 hash buckets, record area, and per-bucket hash
//! tables of (hash, position) pairs.

use std::io;
use std::path::Path;

const HASH_START: u32 = 5381;

fn hash(key: &[u8]) -> u32 {
    let mut h = HASH_START;
    for &b in key {
        h = h.wrapping_add(h << 5);
        h ^= u32::from(b);
    }
    h
}

fn unpack(buf: &[u8], pos: usize) -> Option<u32> {
    let b: [u8; 4] = buf.get(pos..pos + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(b))
}

/// Look up `key` in the database bytes. `Ok(None)` when the key is absent;
/// a truncated or inconsistent file reads as absent too.
pub fn seek(db: &[u8], key: &[u8]) -> Option<Vec<u8>> {
    if db.len() < 2048 {
        return None;
    }
    let h = hash(key);
    let table = 8 * (h & 255) as usize;
    let hash_len = unpack(db, table + 4)?;
    if hash_len == 0 {
        return None;
    }
    let hash_pos = unpack(db, table)?;
    let mut slot = (h >> 8) % hash_len;
    for _ in 0..hash_len {
        let cur = hash_pos as usize + 8 * slot as usize;
        let rec_pos = unpack(db, cur + 4)?;
        if rec_pos == 0 {
            break;
        }
        if unpack(db, cur)? == h {
            let rec = rec_pos as usize;
            let klen = unpack(db, rec)? as usize;
            let dlen = unpack(db, rec + 4)? as usize;
            if klen == key.len() && db.get(rec + 8..rec + 8 + klen)? == key {
                return db.get(rec + 8 + klen..rec + 8 + klen + dlen).map(|d| d.to_vec());
            }
        }
        slot += 1;
        if slot == hash_len {
            slot = 0;
        }
    }
    None
}

/// Open a cdb file and look up one key. A missing or empty file yields
/// `Ok(None)`.
pub fn lookup(path: &Path, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let db = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if db.is_empty() {
        return Ok(None);
    }
    Ok(seek(&db, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal cdb writer for fixtures, mirroring the on-disk layout the
    /// reader expects.
    fn make_cdb(entries: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut records = Vec::new();
        let mut by_bucket: Vec<Vec<(u32, u32)>> = vec![Vec::new(); 256];
        for (k, v) in entries {
            let pos = 2048 + records.len() as u32;
            records.extend_from_slice(&(k.len() as u32).to_le_bytes());
            records.extend_from_slice(&(v.len() as u32).to_le_bytes());
            records.extend_from_slice(k);
            records.extend_from_slice(v);
            let h = hash(k);
            by_bucket[(h & 255) as usize].push((h, pos));
        }
        let mut tables = Vec::new();
        let mut header = Vec::with_capacity(2048);
        let mut table_pos = 2048 + records.len() as u32;
        for bucket in &by_bucket {
            let len = (bucket.len() * 2) as u32;
            header.extend_from_slice(&table_pos.to_le_bytes());
            header.extend_from_slice(&len.to_le_bytes());
            let mut slots = vec![(0u32, 0u32); len as usize];
            for &(h, pos) in bucket {
                let mut s = ((h >> 8) % len) as usize;
                while slots[s].1 != 0 {
                    s = (s + 1) % len as usize;
                }
                slots[s] = (h, pos);
            }
            for (h, pos) in slots {
                tables.extend_from_slice(&h.to_le_bytes());
                tables.extend_from_slice(&pos.to_le_bytes());
            }
            table_pos += len * 8;
        }
        let mut out = header;
        out.extend_from_slice(&records);
        out.extend_from_slice(&tables);
        out
    }

    #[test]
    fn finds_present_keys() {
        let db = make_cdb(&[
            (b"!example.org-", b"example.org\0123\0456\0/var/vpopmail/domains/example.org\0"),
            (b"!example.net-", b"example.net\089\089\0/var/vpopmail/domains/example.net\0"),
        ]);
        let v = seek(&db, b"!example.org-").unwrap();
        assert!(v.starts_with(b"example.org\0"));
        assert!(seek(&db, b"!example.com-").is_none());
    }

    #[test]
    fn empty_db_has_no_keys() {
        let db = make_cdb(&[]);
        assert!(seek(&db, b"!example.org-").is_none());
    }

    #[test]
    fn truncated_db_reads_as_absent() {
        let db = make_cdb(&[(b"!k-", b"v")]);
        assert!(seek(&db[..100], b"!k-").is_none());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(lookup(&dir.path().join("users/cdb"), b"!x-").unwrap().is_none());
    }

    #[test]
    fn many_keys_same_bucket() {
        // force collisions to exercise the probe loop
        let keys: Vec<Vec<u8>> = (0..64u32).map(|i| format!("!d{}.example-", i).into_bytes()).collect();
        let entries: Vec<(&[u8], &[u8])> = keys.iter().map(|k| (k.as_slice(), b"dir".as_slice())).collect();
        let db = make_cdb(&entries);
        for k in &keys {
            assert_eq!(seek(&db, k).unwrap(), b"dir");
        }
    }
}
