// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Upgrades the database schema. See `db::upgrade` for the migrations
//! themselves.

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;

#[derive(Bpaf, Debug)]
pub struct Args {
    #[bpaf(external(crate::parse_db_dir))]
    db_dir: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let (_db_dir, mut conn) = super::open_conn(&args.db_dir, super::OpenMode::ReadWrite)?;
    db::upgrade::run(&mut conn)?;
    Ok(0)
}
