//! Two-party private data processing over secret-shared bits.
//!
//! Two parties, a publisher and a partner, each hold a set of records. A private matching step
//! has already produced a shared *union* of both record sets, in which every slot tells a party
//! which of its own rows (if any) belongs there. This crate turns that union into a secret-shared
//! table of the matched rows of both parties, without revealing which rows matched:
//!
//! 1. The [`adapter`] hides the union slots behind a shuffle and tells each party, for every
//!    match, which row of the *peer* is involved.
//! 2. The [`data_processor`] lets each party pick the peer's rows at these indexes. The rows are
//!    encrypted with AES in counter mode by their owner and jointly decrypted inside the
//!    secret-sharing runtime, so that the decrypted rows stay secret-shared.
//!
//! ## Main Components
//!
//! * [`secret`]: XOR-shared bit planes between two parties, with AND gates evaluated using
//!   multiplication triples from a trusted dealer.
//! * [`circuit`]: AES-128 counter mode decryption evaluated on secret bits.
//! * [`shuffle`]: The permutation step of the adapter.
//! * [`stream`]: Encrypts inputs that do not fit into memory ahead of time and decrypts them
//!   later, possibly split into shards.
//! * [`process`]: Runs the adapter and the data processor back to back.
//! * [`channel`]: Communication abstractions for exchanging data between parties.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use polyudp::{
//!     adapter::{Adapter, AdapterFactory, UnionAdapterFactory},
//!     data_processor::{AesDataProcessor, DataProcessor},
//!     shuffle::insecure::DummyShufflerFactory,
//! };
//!
//! # async fn example(session: polyudp::secret::Session<impl polyudp::channel::Channel>, rows: Vec<Vec<u8>>) -> Result<(), Box<dyn std::error::Error>> {
//! // party 0 holds rows 10, 11 and 12 at union slots 0, 2 and 3
//! let union_map = [10, -1, 11, 12, -1];
//! let adapters = UnionAdapterFactory::new(session.clone(), true, 0, 1, DummyShufflerFactory::new(42));
//! let indexes = adapters.create().adapt(&union_map).await?;
//!
//! let processor = AesDataProcessor::new(session.clone());
//! let mine = processor.process_my_data(&rows, indexes.len()).await?;
//! let theirs = processor.process_peers_data(22, &indexes, 2).await?;
//! session.finish().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Properties
//!
//! The protocols are secure against semi-honest adversaries, assuming that the dealer does not
//! collude with either party. The shufflers in [`shuffle::insecure`] and the data processors in
//! [`data_processor::insecure`] leak their inputs and only exist for testing.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod adapter;
pub mod aes_ctr;
pub mod bits;
pub mod block;
pub mod channel;
pub mod circuit;
pub mod data_processor;
pub mod process;
pub mod secret;
pub mod shuffle;
pub mod stream;
