#![allow(non_snake_case)]

extern crate serde_json;
extern crate serde_yaml;

extern crate tera;

#[macro_use]
extern crate log;

extern crate reqwest;

extern crate regex;

extern crate base64;

extern crate petgraph;

extern crate rusoto_cloudformation;
extern crate rusoto_core;
extern crate rusoto_kms;
extern crate rusoto_ssm;
extern crate rusoto_sts;

#[macro_use]
extern crate failure;

pub use failure::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// The document model: `Document`, `Environment`, `Location`, `Variable`,
/// `ValueBinding`, `Scope`, `Value`.
pub mod document;
pub use document::{Document, Environment, Location, Scope, Value, ValueBinding, Variable};

/// Load from / write to the `envars.yml` textual format.
pub mod codec;

/// Jinja-like template expansion and reference-graph extraction.
pub mod template;

/// Encrypt/decrypt a string under a cloud KMS key with an authenticated context.
pub mod kms;

/// Fetch values from cloud parameter stores, secret managers and stack exports.
pub mod indirection;

/// Turn a `Document` plus an (environment, location) context into a resolved
/// mapping from variable name to string.
pub mod resolve;

/// Check every static invariant of a `Document`, including cross-context cycles.
pub mod validate;

/// Add/update a binding and rotate the KMS key of a `Document`.
pub mod mutate;

/// Detect the ambient cloud account/project id to auto-select a location.
pub mod identity;

pub use resolve::{resolve, ResolveErrKind};
pub use validate::{validate, ValidationFailure};
