// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wraps a real C/C++ compiler to additionally reconstruct, per input file,
//! a side-car mapping expanded/preprocessed lines back to their original
//! source location, without preprocessing the input twice.

pub mod child_runner;
pub mod include_stack;
pub mod linemarker;
pub mod orchestrator;
pub mod reconstructor;

pub use child_runner::{ChildCtx, ChildMode, ChildRunError};
pub use include_stack::{IncludeFrame, IncludeStack, StackError};
pub use linemarker::{Linemarker, ParseError};
pub use orchestrator::{Config, ExitOutcome, OrchestratorError};
pub use reconstructor::{reconstruct, ReconstructError};
