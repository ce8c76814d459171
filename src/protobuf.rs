/*
 * SPDX-FileCopyrightText: 2024-2025 The delta-applier Authors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Protobuf message definitions for the update payload manifest. The
//! generated module is checked in; see protobuf/update_metadata.proto for
//! the schema it was generated from.

pub mod chromeos_update_engine;
