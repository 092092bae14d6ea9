// PMDB - Post-Mortem Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::{fmt, sync::Arc};

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, Bytes};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{encode, AbiError, CompiledArtifact, FunctionDecl, FunctionKind, VariableDecl, Visibility};

/// Errors raised while preparing calldata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallEncodingError {
    /// Wrong number of positional arguments
    #[error("bad args to `{function}` ({expectation}, got {got})")]
    BadArgCount {
        /// Function name
        function: String,
        /// `expected N` or `expected between N and M`
        expectation: String,
        /// Arguments supplied
        got: usize,
    },

    /// Keyword that names no defaulted argument
    #[error("`{function}` has no keyword argument `{keyword}`")]
    UnknownKeyword {
        /// Function name
        function: String,
        /// Offending keyword
        keyword: String,
    },

    /// Argument supplied twice
    #[error("argument `{keyword}` of `{function}` given more than once")]
    DuplicateKeyword {
        /// Function name
        function: String,
        /// Offending keyword
        keyword: String,
    },

    /// A later defaulted argument was given but an earlier one was not
    #[error("`{function}` needs `{keyword}` before later keyword arguments")]
    MissingKeyword {
        /// Function name
        function: String,
        /// Keyword that must also be given
        keyword: String,
    },

    /// No such external function
    #[error("`{contract}` has no external function `{function}`")]
    UnknownFunction {
        /// Contract name
        contract: String,
        /// Requested function
        function: String,
    },

    /// Values do not encode
    #[error(transparent)]
    Abi(#[from] AbiError),
}

/// A deployed instance of a compiled contract.
#[derive(Debug, Clone)]
pub struct Contract {
    /// Compiler output shared by every instance
    pub artifact: Arc<CompiledArtifact>,
    /// Deployed address
    pub address: Address,
    /// Runtime code observed at the address, data section included
    pub bytecode: Bytes,
    /// Creator, when known
    pub created_from: Option<Address>,
}

impl Contract {
    /// An instance whose code is exactly the artifact's runtime code.
    pub fn new(artifact: Arc<CompiledArtifact>, address: Address) -> Self {
        let bytecode = artifact.bytecode_runtime.clone();
        Self { artifact, address, bytecode, created_from: None }
    }

    /// Attach the artifact to code already deployed at `address`.
    ///
    /// The observed code is kept even when it differs from the compiled runtime code; the
    /// mismatch is logged.
    pub fn at(artifact: Arc<CompiledArtifact>, address: Address, observed_code: Bytes) -> Self {
        let section = artifact.immutable_section_bytes;
        let to_check = if section != 0 {
            &observed_code[..observed_code.len().saturating_sub(section)]
        } else {
            &observed_code[..]
        };
        if to_check != &artifact.bytecode_runtime[..] {
            warn!(
                contract = %artifact.contract_name,
                %address,
                "casted bytecode does not match compiled bytecode"
            );
        }
        Self { artifact, address, bytecode: observed_code, created_from: None }
    }

    /// Record the creating address.
    pub fn with_creator(mut self, creator: Address) -> Self {
        self.created_from = Some(creator);
        self
    }

    /// Contract name
    pub fn name(&self) -> &str {
        &self.artifact.contract_name
    }

    /// Trailing immutables blob of the runtime code.
    pub fn data_section(&self) -> &[u8] {
        let size = self.artifact.immutable_section_bytes;
        if size == 0 {
            return &[];
        }
        &self.bytecode[self.bytecode.len().saturating_sub(size)..]
    }

    /// Typed lookup of a named member: external function, storage variable or immutable.
    pub fn member(&self, name: &str) -> Option<Member<'_>> {
        if let Some(function) = self.function(name) {
            return Some(Member::Callable(function));
        }
        let decl = self.artifact.variable(name)?;
        match decl.location {
            crate::VariableLocation::Storage { slot } => Some(Member::Storage { decl, slot }),
            crate::VariableLocation::Immutable { offset } => {
                Some(Member::Immutable { decl, offset })
            }
            crate::VariableLocation::Constant => None,
        }
    }

    /// Handle to an external function.
    pub fn function(&self, name: &str) -> Option<FunctionHandle<'_>> {
        self.artifact
            .functions
            .iter()
            .find(|f| f.name == name && f.visibility == Visibility::External)
            .map(|decl| FunctionHandle { contract: self, decl })
    }

    /// Calldata for calling `function` with the given arguments.
    pub fn encode_call(
        &self,
        function: &str,
        args: &[DynSolValue],
        kwargs: &[(&str, DynSolValue)],
    ) -> Result<Bytes, CallEncodingError> {
        self.function(function)
            .ok_or_else(|| CallEncodingError::UnknownFunction {
                contract: self.name().to_string(),
                function: function.to_string(),
            })?
            .prepare_calldata(args, kwargs)
    }
}

/// A named member of a contract.
#[derive(Debug, Clone, Copy)]
pub enum Member<'a> {
    /// External function
    Callable(FunctionHandle<'a>),
    /// Storage variable at `slot`
    Storage {
        /// Declaration
        decl: &'a VariableDecl,
        /// First slot
        slot: u64,
    },
    /// Immutable at `offset` in the data section
    Immutable {
        /// Declaration
        decl: &'a VariableDecl,
        /// Data-section offset
        offset: usize,
    },
}

/// An external function bound to a deployed instance.
#[derive(Debug, Clone, Copy)]
pub struct FunctionHandle<'a> {
    contract: &'a Contract,
    decl: &'a FunctionDecl,
}

impl<'a> FunctionHandle<'a> {
    /// The declaration
    pub fn decl(&self) -> &'a FunctionDecl {
        self.decl
    }

    /// The owning instance
    pub fn contract(&self) -> &'a Contract {
        self.contract
    }

    /// Encode a call.
    ///
    /// `args` covers every required argument and optionally a prefix of the defaulted
    /// ones; `kwargs` supplies further defaulted arguments by name. Defaulted arguments
    /// can only be omitted from the end. Constructor and fallback calldata carry no
    /// selector.
    pub fn prepare_calldata(
        &self,
        args: &[DynSolValue],
        kwargs: &[(&str, DynSolValue)],
    ) -> Result<Bytes, CallEncodingError> {
        let decl = self.decl;
        let n_pos = decl.n_positional_args();
        let n_total = decl.n_total_args();

        if !(n_pos..=n_total).contains(&args.len()) {
            let expectation = if n_pos == n_total {
                format!("expected {n_total}")
            } else {
                format!("expected between {n_pos} and {n_total}")
            };
            return Err(CallEncodingError::BadArgCount {
                function: decl.name.clone(),
                expectation,
                got: args.len(),
            });
        }

        let given_positionally = args.len() - n_pos;
        let mut by_keyword: Vec<Option<&DynSolValue>> =
            vec![None; decl.keyword_args.len() - given_positionally];
        for (keyword, value) in kwargs {
            let index = decl
                .keyword_args
                .iter()
                .position(|arg| arg.name == *keyword)
                .ok_or_else(|| CallEncodingError::UnknownKeyword {
                    function: decl.name.clone(),
                    keyword: keyword.to_string(),
                })?;
            let duplicate = || CallEncodingError::DuplicateKeyword {
                function: decl.name.clone(),
                keyword: keyword.to_string(),
            };
            let slot = index.checked_sub(given_positionally).ok_or_else(duplicate)?;
            if by_keyword[slot].replace(value).is_some() {
                return Err(duplicate());
            }
        }

        let mut values = args.to_vec();
        for (i, value) in by_keyword.iter().take(kwargs.len()).enumerate() {
            let value = value.ok_or_else(|| CallEncodingError::MissingKeyword {
                function: decl.name.clone(),
                keyword: decl.keyword_args[given_positionally + i].name.clone(),
            })?;
            values.push(value.clone());
        }

        let signature = decl.call_signature(given_positionally + kwargs.len())?;
        let encoded = encode(&signature.arg_types, &values)?;
        debug!(function = %self, signature = %signature.args_signature, "prepared calldata");

        match decl.kind {
            FunctionKind::Constructor | FunctionKind::Fallback => Ok(encoded),
            FunctionKind::Regular => {
                let mut calldata = signature.selector.to_vec();
                calldata.extend_from_slice(&encoded);
                Ok(calldata.into())
            }
        }
    }
}

impl fmt::Display for FunctionHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.contract.name(), self.decl.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, hex, U256};
    use serde_json::json;

    const TOKEN: Address = address!("0x00000000000000000000000000000000000000c0");
    const BOB: Address = address!("0x0000000000000000000000000000000000000b0b");

    fn artifact() -> Arc<CompiledArtifact> {
        let json = json!({
            "contract_name": "Token",
            "compiler_version": "0.3.10",
            "bytecode_runtime": "0x600160",
            "variables": [
                {"name": "owner", "type": "address", "location": {"storage": {"slot": 0}}},
                {"name": "CAP", "type": "uint256", "location": {"immutable": {"offset": 0}}},
                {"name": "DECIMALS", "type": "uint8", "location": "constant"}
            ],
            "functions": [
                {"name": "transfer",
                 "positional_args": [{"name": "to", "type": "address"}],
                 "keyword_args": [{"name": "amount", "type": "uint256"},
                                  {"name": "memo", "type": "Bytes[4]"}],
                 "return_type": "bool"},
                {"name": "__init__", "kind": "constructor",
                 "positional_args": [{"name": "cap", "type": "uint256"}]},
                {"name": "_helper", "visibility": "internal"}
            ],
            "immutable_section_bytes": 32
        });
        Arc::new(CompiledArtifact::from_json_str(&json.to_string()).unwrap())
    }

    fn uint(v: u64) -> DynSolValue {
        DynSolValue::Uint(U256::from(v), 256)
    }

    #[test]
    fn test_member_lookup() {
        pmdb_common::logging::ensure_test_logging(None);
        let contract = Contract::new(artifact(), TOKEN);
        assert!(matches!(contract.member("transfer"), Some(Member::Callable(_))));
        assert!(matches!(contract.member("owner"), Some(Member::Storage { slot: 0, .. })));
        assert!(matches!(contract.member("CAP"), Some(Member::Immutable { offset: 0, .. })));
        assert!(contract.member("DECIMALS").is_none());
        assert!(contract.member("_helper").is_none());
        assert!(contract.member("missing").is_none());
    }

    #[test]
    fn test_data_section_and_attach() {
        pmdb_common::logging::ensure_test_logging(None);
        let mut code = hex!("600160").to_vec();
        code.extend_from_slice(&U256::from(1000).to_be_bytes::<32>());
        let contract = Contract::at(artifact(), TOKEN, code.into()).with_creator(BOB);
        assert_eq!(contract.data_section(), U256::from(1000).to_be_bytes::<32>().as_slice());
        assert_eq!(contract.created_from, Some(BOB));

        // Mismatching code is kept as observed.
        let odd = Contract::at(artifact(), TOKEN, Bytes::from_static(&[0xfe]));
        assert_eq!(&odd.bytecode[..], &[0xfe]);
        assert_eq!(odd.data_section(), &[0xfe]);
    }

    #[test]
    fn test_prepare_calldata_aligns_keywords() {
        pmdb_common::logging::ensure_test_logging(None);
        let contract = Contract::new(artifact(), TOKEN);
        let transfer = contract.function("transfer").unwrap();
        assert_eq!(transfer.to_string(), "Token.transfer");

        let by_keyword =
            transfer.prepare_calldata(&[DynSolValue::Address(BOB)], &[("amount", uint(5))]).unwrap();
        let positional =
            transfer.prepare_calldata(&[DynSolValue::Address(BOB), uint(5)], &[]).unwrap();
        assert_eq!(by_keyword, positional);
        assert_eq!(&by_keyword[..4], &hex!("a9059cbb"));
        assert_eq!(by_keyword.len(), 4 + 64);

        let full = transfer
            .prepare_calldata(
                &[DynSolValue::Address(BOB)],
                &[("memo", DynSolValue::Bytes(vec![1])), ("amount", uint(5))],
            )
            .unwrap();
        assert_eq!(&full[..4], crate::selector("transfer(address,uint256,bytes)").as_slice());
    }

    #[test]
    fn test_prepare_calldata_errors() {
        pmdb_common::logging::ensure_test_logging(None);
        let contract = Contract::new(artifact(), TOKEN);
        let transfer = contract.function("transfer").unwrap();

        let err = transfer.prepare_calldata(&[], &[]).unwrap_err();
        assert_eq!(err.to_string(), "bad args to `transfer` (expected between 1 and 3, got 0)");

        let err = contract.encode_call("__init__", &[], &[]).unwrap_err();
        assert_eq!(err.to_string(), "bad args to `__init__` (expected 1, got 0)");

        let addr = DynSolValue::Address(BOB);
        assert!(matches!(
            transfer.prepare_calldata(&[addr.clone()], &[("fee", uint(1))]),
            Err(CallEncodingError::UnknownKeyword { .. })
        ));
        assert!(matches!(
            transfer.prepare_calldata(&[addr.clone(), uint(1)], &[("amount", uint(1))]),
            Err(CallEncodingError::DuplicateKeyword { .. })
        ));
        assert!(matches!(
            transfer.prepare_calldata(&[addr.clone()], &[("memo", DynSolValue::Bytes(vec![]))]),
            Err(CallEncodingError::MissingKeyword { .. })
        ));
        assert!(matches!(
            transfer.prepare_calldata(&[addr], &[("amount", DynSolValue::Bool(true))]),
            Err(CallEncodingError::Abi(AbiError::Encoding { .. }))
        ));
        assert!(matches!(
            contract.encode_call("_helper", &[], &[]),
            Err(CallEncodingError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn test_constructor_calldata_has_no_selector() {
        pmdb_common::logging::ensure_test_logging(None);
        let contract = Contract::new(artifact(), TOKEN);
        let calldata = contract.encode_call("__init__", &[uint(7)], &[]).unwrap();
        assert_eq!(&calldata[..], U256::from(7).to_be_bytes::<32>().as_slice());
    }
}
