//! Thread builtin variables shared by every kernel in a module

use rspirv::dr::Operand;
use rustc_hash::FxHashMap;
use spirv::{BuiltIn, Decoration, LinkageType, StorageClass, Word};

use super::session::Session;
use crate::diagnostics::{InternalError, Result};
use crate::lir::{Element, Kind, ThreadQuery};

pub fn builtin_for(query: ThreadQuery) -> BuiltIn {
    match query {
        ThreadQuery::GlobalId => BuiltIn::GlobalInvocationId,
        ThreadQuery::GlobalSize => BuiltIn::GlobalSize,
        ThreadQuery::LocalId => BuiltIn::LocalInvocationId,
        ThreadQuery::GroupId => BuiltIn::WorkgroupId,
        ThreadQuery::WorkgroupSize => BuiltIn::WorkgroupSize,
    }
}

/// Import name the OpenCL consumers link builtins by
pub fn link_name(query: ThreadQuery) -> String {
    format!("__spirv_BuiltIn{:?}", builtin_for(query))
}

/// `Input` variables of type `ulong3`, one per query
#[derive(Debug, Clone, Default)]
pub struct Builtins {
    vars: FxHashMap<ThreadQuery, Word>,
    order: Vec<Word>,
}

impl Builtins {
    /// Declare every builtin at module scope
    pub fn declare(session: &mut Session) -> Result<Self> {
        let ulong3 = Kind::vector(Element::I64, 3)?;
        let pointer = session.pointer_to(ulong3, StorageClass::Input)?;
        let mut builtins = Self::default();

        for query in ThreadQuery::ALL {
            let var = session.global_variable(pointer, StorageClass::Input);
            let builder = session.builder();
            builder.decorate(var, Decoration::BuiltIn, [Operand::BuiltIn(builtin_for(query))]);
            builder.decorate(var, Decoration::Constant, []);
            builder.decorate(
                var,
                Decoration::LinkageAttributes,
                [
                    Operand::LiteralString(link_name(query)),
                    Operand::LinkageType(LinkageType::Import),
                ],
            );
            builtins.vars.insert(query, var);
            builtins.order.push(var);
        }

        Ok(builtins)
    }

    pub fn variable(&self, query: ThreadQuery) -> Result<Word> {
        self.vars.get(&query).copied().ok_or_else(|| {
            InternalError::Unimplemented(format!("builtin {:?} was not declared", query)).into()
        })
    }

    /// Entry-point interface list
    pub fn interface(&self) -> Vec<Word> {
        self.order.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::spirv::session::TargetInfo;

    #[test]
    fn test_declares_all_queries() {
        let mut session = Session::new(TargetInfo::default());
        session.emit_header();
        let builtins = Builtins::declare(&mut session).unwrap();
        assert_eq!(builtins.interface().len(), ThreadQuery::ALL.len());

        let module = session.module();
        let built_in_decorations = module
            .annotations
            .iter()
            .filter(|i| i.operands.get(1) == Some(&Operand::Decoration(Decoration::BuiltIn)))
            .count();
        assert_eq!(built_in_decorations, 5);
    }

    #[test]
    fn test_link_names() {
        assert_eq!(
            link_name(ThreadQuery::GlobalId),
            "__spirv_BuiltInGlobalInvocationId"
        );
        assert_eq!(link_name(ThreadQuery::GroupId), "__spirv_BuiltInWorkgroupId");
    }
}
