// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
pub mod commands;
pub mod config;
pub mod constants;
pub mod diff;
pub mod error;
pub mod health;
pub mod kubernetes;
pub mod observe;
pub mod reconcilers;
pub mod render;
pub mod source;
pub mod sync;
pub mod types;

#[cfg(test)]
pub mod test_utils;
