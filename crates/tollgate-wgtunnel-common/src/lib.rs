// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod ip;
pub mod keys;
pub mod peer;

pub use ip::{host_prefix, increment, AddressAllocator, IpError};
pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use peer::{MalformedPeer, PeerState};
