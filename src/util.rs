//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

/// Joins a parameter name onto a dotted prefix, the way nested modules name
/// their parameters (`downsample.module.0.weight`).
pub fn join_name(prefix: &str, name: &str) -> String {
	if prefix.is_empty() { name.to_string() } else { format!("{prefix}.{name}") }
}
