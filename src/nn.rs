//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

pub mod eval_context;
pub mod layers;
pub mod model_context;
pub mod param;

pub use eval_context::EvalContext;
pub use model_context::ModelContext;
pub use param::{Init, Param};
