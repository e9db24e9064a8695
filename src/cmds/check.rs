// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Validates a config file and the class override, then exits.

use crate::config::Config;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;

/// Checks the configuration without starting anything.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    /// Path to the agent TOML config.
    #[bpaf(long, argument("PATH"))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    let classes = config.effective_classes()?;
    let mut classes: Vec<&String> = classes.iter().collect();
    classes.sort();
    println!("config ok: device {}", config.device_id);
    println!(
        "effective classes: {}",
        classes
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(0)
}
