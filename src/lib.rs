/*
 * SPDX-FileCopyrightText: 2024-2025 The delta-applier Authors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! On-device applier for block-level delta update payloads.
//!
//! The host downloader pushes payload bytes into a
//! [`performer::DeltaPerformer`] in arbitrary-sized chunks; the performer
//! parses the manifest, applies the install operations against the rootfs
//! and kernel partitions, checkpoints resume state to a [`prefs::Prefs`]
//! store, and verifies the payload hash and signature at the end. It emits
//! `tracing` events but performs no subscriber setup of its own.

pub mod crypto;
pub mod extent_writer;
pub mod format;
pub mod hash;
pub mod performer;
pub mod prefs;
pub mod protobuf;
pub mod terminator;
pub mod util;
