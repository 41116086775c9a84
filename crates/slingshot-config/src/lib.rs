// SPDX-License-Identifier: Apache-2.0
//! Config service and storage port shared by the Slingshot CLI and plugins.

pub mod config;
