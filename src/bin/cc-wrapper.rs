// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::process::ExitCode;

use anyhow::Context;
use cc_wrapper::orchestrator::{self, Config};

fn main() -> anyhow::Result<ExitCode> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .context("failed to install the tracing subscriber")?;

    let config = Config::from_env();
    let argv: Vec<String> = env::args().skip(1).collect();
    let outcome = orchestrator::run(&config, &argv);
    Ok(ExitCode::from(outcome.code() as u8))
}
