// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Canonical wait budgets shared by every part of the harness.

use std::time::Duration;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(600);
pub const LONG_TEST_TIMEOUT: Duration = Duration::from_secs(4200);
pub const UPDATE_TEST_TIMEOUT: Duration = Duration::from_secs(7200);
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(5400);

/// How long a rebooting server is given before it is restarted again.
pub const UNATTENDED_BOOT_TIMEOUT: Duration = Duration::from_secs(900);

/// Default channel timeout for a single ssh invocation.
pub const SSH_TIMEOUT: Duration = Duration::from_secs(600);
