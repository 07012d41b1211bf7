//! Checkmk-style special agents.
//!
//! The dominant component is the AWS agent: per requested service it builds a
//! graph of collection sections, runs them sequentially, fans computed
//! contents out to dependent sections through a small mediator, and prints
//! everything in the line-oriented agent wire format. A secondary agent
//! scrapes HP StoreOnce appliances, and the [`salesforce`] module parses the
//! pre-fetched Salesforce status feed for the legacy check.

#![warn(clippy::all, rust_2018_idioms)]

pub mod args;
pub mod cache;
pub mod credentials;
pub mod distributor;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod salesforce;
pub mod section;
pub mod sections;
pub mod storeonce;
pub mod tags;
