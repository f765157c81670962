//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod addr;
pub mod capabilities;
pub mod scheduler;
pub mod socket;
pub mod time;
