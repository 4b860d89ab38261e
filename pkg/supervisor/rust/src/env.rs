// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::path::Path;

/// Read a `KEY=VALUE` environment file. Blank lines, `#` comments and an
/// optional leading `export ` are accepted; one layer of matching quotes is
/// removed from values. Later assignments win.
pub fn read_environment_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading environment file: {}", path.display()))?;
    let mut vars = BTreeMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, raw_val)) = trimmed.split_once('=') else {
            bail!("line {}: expected KEY=VALUE", lineno + 1);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("line {}: empty variable name", lineno + 1);
        }
        vars.insert(key.to_string(), unquote(raw_val.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(val: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = val
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    val
}

/// Layer explicit `env` entries over variables read from an environment file.
pub fn layer(
    mut base: BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    for (k, v) in overrides {
        base.insert(k.clone(), v.clone());
    }
    base
}
