//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod debug;
pub mod engine;
pub mod error;
pub mod network;
pub mod ops;
pub mod packet;
pub mod session;
