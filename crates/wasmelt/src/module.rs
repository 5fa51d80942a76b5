//! Per-module compile-time state.
//!
//! Everything here is immutable while functions compile: the type section,
//! the function-index → type-index table, global value types, the interned
//! signatures and the runtime record offsets. A [`ModuleEnv`] can be shared
//! by reference across any number of `Frontend` instances running on
//! separate threads.

use std::collections::HashMap;

use crate::abi::OffsetData;
use crate::ssa::{SigId, Signature, SsaType};

/// WebAssembly value type as seen at the frontend boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    V128,
    FuncRef,
    ExternRef,
}

impl ValueType {
    /// Convert wasmparser's value type to ours, for module loaders that
    /// feed section data straight from `wasmparser`.
    pub fn from_wasmparser(vt: wasmparser::ValType) -> Self {
        use wasmparser::{RefType, ValType};
        match vt {
            ValType::I32 => ValueType::I32,
            ValType::I64 => ValueType::I64,
            ValType::F32 => ValueType::F32,
            ValType::F64 => ValueType::F64,
            ValType::V128 => ValueType::V128,
            ValType::Ref(r) => {
                if r == RefType::FUNCREF {
                    ValueType::FuncRef
                } else {
                    ValueType::ExternRef
                }
            }
        }
    }

    /// Decode a value type from its binary-format byte, if it is one.
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x7f => Some(ValueType::I32),
            0x7e => Some(ValueType::I64),
            0x7d => Some(ValueType::F32),
            0x7c => Some(ValueType::F64),
            0x7b => Some(ValueType::V128),
            0x70 => Some(ValueType::FuncRef),
            0x6f => Some(ValueType::ExternRef),
            _ => None,
        }
    }

    /// Map to the SSA type lowered code computes with. Total: references
    /// become pointer-sized integers.
    pub fn ssa_type(self) -> SsaType {
        match self {
            ValueType::I32 => SsaType::I32,
            ValueType::I64 => SsaType::I64,
            ValueType::F32 => SsaType::F32,
            ValueType::F64 => SsaType::F64,
            ValueType::V128 => SsaType::V128,
            ValueType::FuncRef | ValueType::ExternRef => SsaType::Ptr,
        }
    }
}

/// A Wasm function type (params → results), as stored in the type section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FunctionType {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

impl FunctionType {
    pub fn new(
        params: impl IntoIterator<Item = ValueType>,
        results: impl IntoIterator<Item = ValueType>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    /// The type of a block with no parameters and no results.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_wasmparser(ft: &wasmparser::FuncType) -> Self {
        Self {
            params: ft.params().iter().copied().map(ValueType::from_wasmparser).collect(),
            results: ft.results().iter().copied().map(ValueType::from_wasmparser).collect(),
        }
    }
}

/// Interns SSA call signatures so structurally identical function types
/// share one handle per module.
#[derive(Debug, Default)]
pub struct SignatureInterner {
    by_type: HashMap<FunctionType, SigId>,
    signatures: Vec<Signature>,
}

impl SignatureInterner {
    /// Intern `ty`, prepending the two implicit pointer-sized context
    /// parameters. Identical function types return the same handle.
    pub fn intern(&mut self, ty: &FunctionType) -> SigId {
        if let Some(&id) = self.by_type.get(ty) {
            return id;
        }
        let mut params = Vec::with_capacity(ty.params.len() + 2);
        params.push(SsaType::Ptr); // exec_ctx
        params.push(SsaType::Ptr); // module_ctx
        params.extend(ty.params.iter().map(|vt| vt.ssa_type()));
        let results = ty.results.iter().map(|vt| vt.ssa_type()).collect();

        let id = SigId(self.signatures.len() as u32);
        self.signatures.push(Signature { params, results });
        self.by_type.insert(ty.clone(), id);
        id
    }

    pub fn get(&self, id: SigId) -> &Signature {
        &self.signatures[id.index()]
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Read-only module state consulted while lowering a function.
#[derive(Debug, Default)]
pub struct ModuleEnv {
    /// The type section.
    types: Vec<FunctionType>,
    /// Interned signature of each type-section entry.
    type_sigs: Vec<SigId>,
    /// Function index space: type index per function (imports included).
    functions: Vec<u32>,
    /// Global index space: value type per global.
    globals: Vec<ValueType>,
    signatures: SignatureInterner,
    offsets: OffsetData,
}

impl ModuleEnv {
    pub fn new(offsets: OffsetData) -> Self {
        Self { offsets, ..Self::default() }
    }

    /// Append a type-section entry and return its type index.
    pub fn push_type(&mut self, ty: FunctionType) -> u32 {
        let idx = self.types.len() as u32;
        self.type_sigs.push(self.signatures.intern(&ty));
        self.types.push(ty);
        idx
    }

    /// Append a function (import or local) and return its function index.
    pub fn push_function(&mut self, type_idx: u32) -> u32 {
        debug_assert!((type_idx as usize) < self.types.len());
        let idx = self.functions.len() as u32;
        self.functions.push(type_idx);
        idx
    }

    /// Append a global and return its global index.
    pub fn push_global(&mut self, ty: ValueType) -> u32 {
        let idx = self.globals.len() as u32;
        self.globals.push(ty);
        idx
    }

    /// The type section, as the cursor's block-type decoder sees it.
    pub fn types(&self) -> &[FunctionType] {
        &self.types
    }

    pub fn type_at(&self, type_idx: u32) -> Option<&FunctionType> {
        self.types.get(type_idx as usize)
    }

    pub fn sig_of_type(&self, type_idx: u32) -> Option<SigId> {
        self.type_sigs.get(type_idx as usize).copied()
    }

    pub fn func_type(&self, func_idx: u32) -> Option<&FunctionType> {
        let type_idx = *self.functions.get(func_idx as usize)?;
        self.types.get(type_idx as usize)
    }

    pub fn func_sig(&self, func_idx: u32) -> Option<SigId> {
        let type_idx = *self.functions.get(func_idx as usize)?;
        self.sig_of_type(type_idx)
    }

    pub fn global_type(&self, global_idx: u32) -> Option<ValueType> {
        self.globals.get(global_idx as usize).copied()
    }

    pub fn signatures(&self) -> &SignatureInterner {
        &self.signatures
    }

    pub fn offsets(&self) -> &OffsetData {
        &self.offsets
    }
}
