use super::IrBuilder;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{BinaryOp, Opcode, SimdLane, SimdOp, Type};
use crate::wasm::module_info::ValType;

fn scalar_val_type(lane: SimdLane) -> ValType {
    match lane.scalar_type() {
        Type::Int64 => ValType::I64,
        Type::Float => ValType::F32,
        Type::Double => ValType::F64,
        _ => ValType::I32,
    }
}

fn check_lane_index(lane: SimdLane, index: u8) -> CompileResult<()> {
    if index >= lane.lane_count() {
        return Err(CompileError::InvalidIndex {
            kind: "lane",
            index: index as u32,
        });
    }
    Ok(())
}

impl<'a, 'arena> IrBuilder<'a, 'arena> {
    fn require_simd(&self) -> CompileResult<()> {
        if !self.options.enable_simd {
            return Err(CompileError::unsupported("v128 with SIMD disabled"));
        }
        Ok(())
    }

    pub fn add_v128_const(&mut self, bits: u128) -> CompileResult<()> {
        self.require_simd()?;
        let c = self.emit(Opcode::ConstVector(bits), Type::V128, &[]);
        self.push(c, ValType::V128);
        Ok(())
    }

    pub fn add_simd(&mut self, op: SimdOp) -> CompileResult<()> {
        self.require_simd()?;
        let (operands, result) = match op {
            SimdOp::Splat(_) => (1, ValType::V128),
            SimdOp::AnyTrue => (1, ValType::I32),
            SimdOp::ExtractLane { lane, index, .. } => {
                check_lane_index(lane, index)?;
                (1, scalar_val_type(lane))
            }
            SimdOp::ReplaceLane { lane, index } => {
                check_lane_index(lane, index)?;
                (2, ValType::V128)
            }
            SimdOp::Lanewise { op, .. } => {
                if !matches!(
                    op,
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::FMin | BinaryOp::FMax
                ) {
                    return Err(CompileError::unsupported(format!("lane-wise {:?}", op)));
                }
                (2, ValType::V128)
            }
            SimdOp::Bitwise(op) => {
                if !matches!(op, BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor) {
                    return Err(CompileError::unsupported(format!("v128 {:?}", op)));
                }
                (2, ValType::V128)
            }
        };
        let children = self.pop_n(operands, "simd")?;
        let value = self.emit(Opcode::Simd(op), result.to_ir(), &children);
        self.push(value, result);
        Ok(())
    }
}
