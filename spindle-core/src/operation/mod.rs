//! Remote operation traits.
//!
//! An [`Operation`] is the unit of work the engine distributes: a
//! serializable value with an `execute` method mapping its input to an output.
//! Because workers may be separate processes, or run on another host, a task
//! cannot carry a function pointer. It carries the operation's registered
//! name and its serialized value instead, and the worker looks the name up in
//! a link-time registry populated by
//! [`#[derive(RemoteExecute)]`](crate::RemoteExecute).
//!
//! ## Example
//!
//! ```
//! use spindle::{RemoteExecute, operation::{Operation, Result}};
//! use serde::{Deserialize, Serialize};
//!
//! /// Height of a ball cutter's tip touching a flat floor at `z`.
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! struct BallTipHeight {
//!     radius: f64,
//! }
//!
//! impl Operation for BallTipHeight {
//!     type Input = (f64,);
//!     type Output = f64;
//!
//!     fn execute(&self, (floor,): Self::Input) -> Result<Self::Output> {
//!         Ok(floor + self.radius)
//!     }
//! }
//!
//! assert_eq!(BallTipHeight { radius: 3.0 }.execute((1.0,)).unwrap(), 4.0);
//! ```
//!
//! The derived name is the operation's module path plus its type name, so it
//! is stable across the submitting binary and the worker binary as long as
//! both link the crate defining the operation.
use std::fmt::Debug;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::serializer::{Serializable, Serializer};

/// Identity of an operation in the link-time registry.
///
/// Implemented by the [`RemoteExecute`](crate::RemoteExecute) derive macro.
pub trait RemoteExecute {
    const NAME: &'static str;
}

/// Decoding of an operation's input from its encoded argument list.
///
/// Implemented for tuples of up to six deserializable elements, one element
/// per argument.
pub trait FromArgs: Sized {
    fn from_args(serializer: Serializer, args: &[Bytes]) -> anyhow::Result<Self>;
}

impl FromArgs for () {
    fn from_args(_: Serializer, args: &[Bytes]) -> anyhow::Result<Self> {
        anyhow::ensure!(args.is_empty(), "expected no arguments, got {}", args.len());
        Ok(())
    }
}

macro_rules! impl_from_args {
    ($len:expr; $($ty:ident $idx:tt),+) => {
        impl<$($ty: DeserializeOwned),+> FromArgs for ($($ty,)+) {
            fn from_args(serializer: Serializer, args: &[Bytes]) -> anyhow::Result<Self> {
                anyhow::ensure!(
                    args.len() == $len,
                    "expected {} arguments, got {}",
                    $len,
                    args.len()
                );
                Ok(($(serializer.from_bytes::<$ty>(&args[$idx])?,)+))
            }
        }
    };
}

impl_from_args!(1; A 0);
impl_from_args!(2; A 0, B 1);
impl_from_args!(3; A 0, B 1, C 2);
impl_from_args!(4; A 0, B 1, C 2, D 3);
impl_from_args!(5; A 0, B 1, C 2, D 3, E 4);
impl_from_args!(6; A 0, B 1, C 2, D 3, E 4, F 5);

/// An operation that can be performed by a worker.
///
/// Akin to a function that maps an input to an output, it defines the
/// signature and semantics of a computation. Operations should be pure: a
/// cancelled batch may leave some of its tasks executed and their results
/// discarded.
pub trait Operation: RemoteExecute + Serializable {
    /// The input type of the operation.
    type Input: FromArgs + Debug;
    /// The output type of the operation.
    type Output: Serializable + Debug;

    /// Execute the operation on the given input.
    fn execute(&self, input: Self::Input) -> Result<Self::Output>;

    /// Get the input from the encoded arguments.
    fn input_from_args(&self, serializer: Serializer, args: &[Bytes]) -> Result<Self::Input> {
        <Self::Input as FromArgs>::from_args(serializer, args).map_err(OperationError::fatal)
    }

    /// Get a byte representation of the output.
    fn output_to_bytes(&self, serializer: Serializer, output: Self::Output) -> Result<Bytes> {
        serializer.to_bytes(&output).map_err(OperationError::fatal)
    }

    /// Decode the arguments and execute.
    fn execute_args(&self, serializer: Serializer, args: &[Bytes]) -> Result<Self::Output> {
        self.input_from_args(serializer, args)
            .and_then(|input| self.execute(input))
    }

    /// Get a byte representation of the operation.
    fn as_bytes(&self, serializer: Serializer) -> Result<Bytes> {
        serializer.to_bytes(self).map_err(OperationError::fatal)
    }

    fn from_bytes(serializer: Serializer, input: &[u8]) -> Result<Self> {
        serializer.from_bytes(input).map_err(OperationError::fatal)
    }
}

/// Type-erased entry point of a registered operation: decodes the operation
/// and its arguments, executes, and encodes the output.
pub type ExecuteFn = fn(Serializer, &[u8], &[Bytes]) -> Result<Bytes>;

/// One registered operation.
pub struct OperationEntry {
    pub name: &'static str,
    pub execute: ExecuteFn,
}

/// Find a registered operation by name.
pub fn lookup(name: &str) -> Option<&'static OperationEntry> {
    crate::__private::OPERATIONS
        .iter()
        .find(|entry| entry.name == name)
}

/// Execute a registered operation from its serialized parts. Used by the
/// derive macro's generated entry points.
pub fn execute_registered<Op: Operation>(
    serializer: Serializer,
    op: &[u8],
    args: &[Bytes],
) -> Result<Bytes> {
    let op = Op::from_bytes(serializer, op)?;
    let output = op.execute_args(serializer, args)?;
    op.output_to_bytes(serializer, output)
}

mod error;
pub use error::*;

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, crate::RemoteExecute)]
    #[spindle(internal)]
    struct Offset(f64);

    impl Operation for Offset {
        type Input = (f64, f64);
        type Output = (f64, f64);

        fn execute(&self, (x, y): Self::Input) -> Result<Self::Output> {
            Ok((x + self.0, y + self.0))
        }
    }

    fn encode_args(serializer: Serializer) -> Vec<Bytes> {
        vec![
            serializer.to_bytes(&1.0_f64).unwrap(),
            serializer.to_bytes(&2.0_f64).unwrap(),
        ]
    }

    #[test]
    fn derived_name_is_module_qualified() {
        assert!(Offset::NAME.ends_with("operation::test::Offset"));
    }

    #[test]
    fn registered_operations_are_found_by_name() {
        let serializer = Serializer::Postcard;
        let entry = lookup(Offset::NAME).expect("registered");
        let op = Offset(0.5).as_bytes(serializer).unwrap();

        let output = (entry.execute)(serializer, &op, &encode_args(serializer)).unwrap();
        let decoded: (f64, f64) = serializer.from_bytes(&output).unwrap();
        assert_eq!(decoded, (1.5, 2.5));

        assert!(lookup("no::such::Operation").is_none());
    }

    #[test]
    fn wrong_arity_is_fatal() {
        let serializer = Serializer::Cbor;
        let args = &encode_args(serializer)[..1];

        let err = Offset(1.0).execute_args(serializer, args).unwrap_err();
        assert!(matches!(err, OperationError::Fatal { .. }));
        assert!(err.to_string().contains("expected 2 arguments, got 1"));
    }
}
