//! # VC Test Utilities
//!
//! Shared test utilities for the Voice Controller.
//!
//! ## Modules
//!
//! - `mock_engine` - Scripted in-memory media engine with a call log
//! - `mock_validator` - Backend validator that accepts or rejects per user/channel
//! - `socket` - In-memory WebSocket client driving a real session task
//! - `fixtures` - Test rig wiring controller, mocks and session context
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let rig = TestRig::new();
//!     let (mut alice, _) = rig.join("alice", "chan-1").await;
//!     alice.announce_capabilities().await;
//!     let transport_id = alice.create_transport().await;
//!     let producer_id = alice.produce(&transport_id).await;
//! }
//! ```

pub mod fixtures;
pub mod mock_engine;
pub mod mock_validator;
pub mod socket;

pub use fixtures::*;
pub use mock_engine::*;
pub use mock_validator::*;
pub use socket::*;
