// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod keys;
pub mod logging;
pub mod secret;

pub use keys::{
	load_private_key_env, load_public_key_env, KeyError, WgKeyPair, WgPrivateKey, WgPublicKey,
};
pub use logging::{init_tracing, init_tracing_with_level, level_directive};
pub use secret::{Secret, SecretString, REDACTED};
