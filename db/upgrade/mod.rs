// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Forward-only schema migrations (spec.md §4.9, §8 "Schema monotonicity").
//!
//! Each migration is a single SQL transaction that ends by inserting a row
//! into `schema_version` with the new version number. There is currently
//! only one schema version; this module exists so a future migration has
//! a place to land without touching `db::init`. Legacy per-column
//! migrations (ALTER TABLE ADD COLUMN dances) are obsolete and must not be
//! reintroduced here.

use base::{bail, Error};
use rusqlite::params;

/// One forward migration: takes the database from `version - 1` to
/// `version` (where this entry sits at index `version - 1` in
/// [`UPGRADERS`]).
type Upgrader = fn(&rusqlite::Transaction) -> Result<(), Error>;

static UPGRADERS: &[Upgrader] = &[];

/// Brings `conn` from its current schema version up to
/// [`crate::db::EXPECTED_SCHEMA_VERSION`], applying each intervening
/// migration in its own transaction. A fresh database (no `schema_version`
/// table) must be created with [`crate::db::init`] instead; this function
/// only handles `Some(version) < EXPECTED_SCHEMA_VERSION`.
pub fn run(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    let Some(mut version) = crate::db::get_schema_version(conn)? else {
        bail!(
            FailedPrecondition,
            msg("database has no schema_version table; use `nvr init` on a fresh database instead"),
        );
    };
    if version > crate::db::EXPECTED_SCHEMA_VERSION {
        bail!(
            FailedPrecondition,
            msg(
                "database schema version {version} is newer than this binary supports ({})",
                crate::db::EXPECTED_SCHEMA_VERSION,
            ),
        );
    }
    while version < crate::db::EXPECTED_SCHEMA_VERSION {
        let upgrader = UPGRADERS
            .get(version as usize)
            .ok_or_else(|| base::err!(Internal, msg("no upgrader registered for version {version}")))?;
        let tx = conn.transaction()?;
        upgrader(&tx)?;
        version += 1;
        tx.execute(
            "insert into schema_version (version, notes, run_ts_sec) values (?, ?, ?)",
            params![version, format!("upgrade to version {version}"), 0],
        )?;
        tx.commit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_to_date_database_is_a_noop() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::init(&mut conn).unwrap();
        run(&mut conn).unwrap();
        assert_eq!(
            crate::db::get_schema_version(&conn).unwrap(),
            Some(crate::db::EXPECTED_SCHEMA_VERSION)
        );
    }
}
