//! Tier-up counters and OSR entries.

use super::IrBuilder;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{
    BinaryOp, CompareOp, EntrypointKind, Frequency, Opcode, PatchpointDescriptor, PatchpointKind,
    Type, ValueId,
};
use crate::wasm::instance;

impl<'a, 'arena> IrBuilder<'a, 'arena> {
    /// Add `increment` to this function's counter; Int32 1 once it passes
    /// the threshold.
    fn bump_tier_up_counter(&mut self, increment: u32) -> ValueId {
        let offset = instance::INSTANCE_TIER_UP_COUNTERS + 4 * self.function_index as i32;
        let inst = self.instance();
        let count = self.load(Type::Int32, 4, false, inst, offset);
        let step = self.const32(increment as i32);
        let next = self.binary(BinaryOp::Add, Type::Int32, count, step);
        self.store(4, inst, offset, next);
        let threshold = self.const32(self.options.tier_up.threshold as i32);
        self.compare(CompareOp::Above, next, threshold)
    }

    /// Branch to a rare block holding `patchpoint` and rejoin after it.
    fn guarded_rare_path(&mut self, condition: ValueId, patchpoint: impl FnOnce(&mut Self)) {
        let rare = self.new_block(Frequency::Rare);
        let rejoin = self.new_block(Frequency::Normal);
        self.terminate(Opcode::Branch, &[condition], &[rare, rejoin]);
        self.current = rare;
        patchpoint(self);
        self.jump(rejoin);
        self.current = rejoin;
    }

    pub(super) fn emit_entry_tier_up_check(&mut self) {
        let increment = self.options.tier_up.function_entry_increment;
        let hot = self.bump_tier_up_counter(increment);
        self.guarded_rare_path(hot, |b| {
            b.emit_patchpoint(PatchpointKind::TierUp { loop_index: None }, &[], None);
        });
        self.session.record_tier_up_check();
    }

    /// Counter check at the head of the loop body of frame `index`. With
    /// OSR enabled the trigger also carries the state an OSR entry into
    /// this loop restores.
    pub(super) fn emit_loop_tier_up_check(&mut self, index: usize) {
        let increment = self.options.tier_up.loop_increment;
        let loop_index = self.controls[index].loop_index;
        let hot = self.bump_tier_up_counter(increment);
        let with_osr = self.options.enable_osr && !self.is_inlinee();

        self.guarded_rare_path(hot, |b| {
            if !with_osr {
                b.emit_patchpoint(PatchpointKind::TierUp { loop_index: None }, &[], None);
                return;
            }
            let state = b.full_state();
            let (values, layout) = b.read_state(&state);
            let stack_map = b.compilation.stack_maps.len() as u32;
            let id = b.compilation.procedure.add_patchpoint(PatchpointDescriptor {
                kind: PatchpointKind::TierUp { loop_index },
                call_site: None,
                stack_map: Some(stack_map),
            });
            let trigger = b.emit(Opcode::Patchpoint(id), Type::Void, &values);
            b.compilation.osr_entry_scratch_size =
                b.compilation.osr_entry_scratch_size.max(layout.size_bytes());
            b.record_stack_map(None, trigger, 0, layout);
        });
        self.session.record_tier_up_check();
    }

    /// Entrypoint that resumes the loop of frame `index` from a buffer
    /// holding the enclosing state followed by the loop parameters.
    pub(super) fn build_osr_entry(&mut self, index: usize) -> CompileResult<()> {
        let data = &self.controls[index];
        let loop_index = data
            .loop_index
            .ok_or_else(|| CompileError::internal("OSR entry into a frame that is not a loop"))?;
        let body = data.branch_target();
        let phis = data.phis.clone();
        let params: Vec<Type> = data.params.iter().map(|t| t.to_ir()).collect();

        let prefix = self.state_prefix(index);
        let mut types: Vec<Type> = prefix.iter().map(|&(_, ty)| ty).collect();
        types.extend(params.iter().copied());
        let layout = self.entry_layout(types);

        let resume = self.current;
        let entry = self.new_block(Frequency::Rare);
        self.compilation
            .procedure
            .add_entrypoint(entry, EntrypointKind::Osr { loop_index });
        self.current = entry;
        let buffer = self.restore_state(&prefix, &layout);
        let values: Vec<ValueId> = params
            .iter()
            .enumerate()
            .map(|(i, &ty)| {
                let offset = layout.offset(prefix.len() + i) as i32;
                self.load(ty, ty.size_bytes() as u8, false, buffer, offset)
            })
            .collect();
        self.unify(&phis, &values);
        self.jump(body);
        self.current = resume;

        self.compilation.osr_entry_scratch_size =
            self.compilation.osr_entry_scratch_size.max(layout.size_bytes());
        log::debug!(
            "OSR entry for loop {} restores {} slots",
            loop_index,
            layout.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::options::CompilerOptions;
    use crate::core::test_utils::test::TestContext;
    use crate::ir::{EntrypointKind, Opcode, PatchpointKind};
    use crate::wasm::builder::IrBuilder;
    use crate::wasm::compilation::Compilation;
    use crate::wasm::instruction::{BlockType, Instruction};
    use crate::wasm::module_info::{FunctionBody, FunctionType, ModuleInformation, TypeDefinition, ValType};

    fn module() -> ModuleInformation {
        let mut module = ModuleInformation {
            types: vec![TypeDefinition::Func(FunctionType::new(vec![ValType::I32], vec![]))],
            functions: vec![FunctionBody { type_index: 0, locals: vec![ValType::F64], code: vec![] }],
            ..Default::default()
        };
        module.publish_callees();
        module
    }

    fn build(options: &CompilerOptions) -> Compilation {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, options, &session, 0).unwrap();
            b.add_loop(BlockType::Empty).unwrap();
            b.add_local_get(0).unwrap();
            b.add_br_if(0).unwrap();
            b.add_end().unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        compilation
    }

    fn tier_ups(compilation: &Compilation) -> Vec<PatchpointKind> {
        compilation
            .procedure
            .patchpoints()
            .iter()
            .map(|p| p.kind)
            .filter(|k| matches!(k, PatchpointKind::TierUp { .. }))
            .collect()
    }

    #[test]
    fn test_no_checks_without_tier_up() {
        let compilation = build(&CompilerOptions::default());
        assert!(tier_ups(&compilation).is_empty());
        assert!(compilation.stack_maps.is_empty());
    }

    #[test]
    fn test_entry_and_loop_checks() {
        let options = CompilerOptions {
            enable_tier_up: true,
            ..Default::default()
        };
        let compilation = build(&options);
        assert_eq!(
            tier_ups(&compilation),
            vec![
                PatchpointKind::TierUp { loop_index: None },
                PatchpointKind::TierUp { loop_index: None },
            ]
        );
        assert_eq!(compilation.osr_entry_scratch_size, 0);
    }

    #[test]
    fn test_osr_trigger_and_entry_share_layout() {
        let options = CompilerOptions {
            enable_tier_up: true,
            enable_osr: true,
            osr_entry_loop: Some(0),
            ..Default::default()
        };
        let compilation = build(&options);
        assert!(tier_ups(&compilation).contains(&PatchpointKind::TierUp { loop_index: Some(0) }));
        assert_eq!(compilation.stack_maps.len(), 1);
        // i32 parameter and f64 local
        assert_eq!(compilation.stack_maps[0].layout.len(), 2);
        assert_eq!(compilation.osr_entry_scratch_size, 16);

        let osr = compilation
            .procedure
            .entrypoints()
            .iter()
            .filter(|e| e.kind == EntrypointKind::Osr { loop_index: 0 })
            .count();
        assert_eq!(osr, 1);
        assert_eq!(compilation.procedure.count_values(|op| *op == Opcode::EntryBuffer), 1);
    }

    #[test]
    fn test_inlined_loops_do_not_shift_loop_numbers() {
        let mut module = module();
        module.types.push(TypeDefinition::Func(FunctionType::new(vec![ValType::I32], vec![ValType::I32])));
        module.functions.push(FunctionBody {
            type_index: 1,
            locals: vec![],
            code: vec![
                Instruction::Loop(BlockType::Empty),
                Instruction::End,
                Instruction::LocalGet(0),
                Instruction::End,
            ],
        });
        module.publish_callees();
        let options = CompilerOptions {
            enable_tier_up: true,
            enable_osr: true,
            osr_entry_loop: Some(0),
            ..Default::default()
        };
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            b.add_local_get(0).unwrap();
            b.add_call(1).unwrap();
            b.add_drop().unwrap();
            b.add_loop(BlockType::Empty).unwrap();
            b.add_local_get(0).unwrap();
            b.add_br_if(0).unwrap();
            b.add_end().unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        assert_eq!(compilation.inlined_functions, vec![1]);
        assert_eq!(compilation.loop_count(), 1);
        assert!(compilation
            .procedure
            .entrypoints()
            .iter()
            .any(|e| e.kind == EntrypointKind::Osr { loop_index: 0 }));
        assert!(tier_ups(&compilation).contains(&PatchpointKind::TierUp { loop_index: Some(0) }));
    }
}
