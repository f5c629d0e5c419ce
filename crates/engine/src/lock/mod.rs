// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

pub(crate) use reader_info::{ReaderInfo, TakeResult};

mod reader_info;
