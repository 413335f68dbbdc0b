// This module reads a small line-oriented module listing into ModuleInformation, so tests and
// the dump binary can describe functions without a binary decoder. Lines starting at column
// zero with a directive keyword declare module entities in index order: `type`, `import`,
// `memory`, `table`, `global`, `tag` and `func`. Indented lines after a `func` directive form
// that function's body: an optional `local` line followed by one instruction per line using
// the usual wasm text mnemonics and immediates, for example `i32.load8_u offset=4`,
// `br_table 0 1 2` (the last label is the default) or `struct.get_s 1 0`. Value types are
// single keywords (`i32`, `funcref`, ...) or parenthesized `(ref null? heap)` forms. `;`
// starts a comment. Every error carries the 1-based line it was found on.

//! Text format for module listings.

use super::instruction::{BlockType, Instruction, MemArg, NumType, NumericOp};
use super::module_info::{
    ArrayType, FieldType, FunctionBody, FunctionType, GlobalInfo, HeapType, MemoryInfo,
    ModuleInformation, RefType, StorageType, StructType, TableInfo, TagInfo, TypeDefinition,
    ValType,
};
use crate::ir::{AtomicOp, BinaryOp, CompareOp, ConvertOp, SimdLane, SimdOp, UnaryOp};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Whitespace separated tokens with parentheses split off.
fn tokenize(line: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        let boundary = c.is_whitespace() || c == '(' || c == ')';
        if boundary {
            if let Some(s) = start.take() {
                tokens.push(&line[s..i]);
            }
            if c == '(' || c == ')' {
                tokens.push(&line[i..i + 1]);
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push(&line[s..]);
    }
    tokens
}

struct Tokens<'t> {
    line: usize,
    tokens: Vec<&'t str>,
    pos: usize,
}

impl<'t> Tokens<'t> {
    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError { line: self.line, message: message.into() }
    }

    fn peek(&self) -> Option<&'t str> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<&'t str> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, what: &str) -> ParseResult<&'t str> {
        self.next().ok_or_else(|| self.error(format!("expected {}", what)))
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn finish(&self) -> ParseResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(extra) => Err(self.error(format!("unexpected '{}'", extra))),
        }
    }

    fn u32(&mut self) -> ParseResult<u32> {
        let token = self.expect("an index")?;
        parse_unsigned(token)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| self.error(format!("bad index '{}'", token)))
    }

    fn u8(&mut self) -> ParseResult<u8> {
        let v = self.u32()?;
        u8::try_from(v).map_err(|_| self.error(format!("lane {} out of range", v)))
    }

    fn heap_type(&mut self) -> ParseResult<HeapType> {
        let token = self.expect("a heap type")?;
        Ok(match token {
            "func" => HeapType::Func,
            "extern" => HeapType::Extern,
            "any" => HeapType::Any,
            "eq" => HeapType::Eq,
            "i31" => HeapType::I31,
            "struct" => HeapType::Struct,
            "array" => HeapType::Array,
            "none" => HeapType::None,
            other => HeapType::Concrete(
                parse_unsigned(other)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| self.error(format!("bad heap type '{}'", other)))?,
            ),
        })
    }

    fn ref_type(&mut self) -> ParseResult<RefType> {
        match self.val_type()? {
            ValType::Ref(r) => Ok(r),
            other => Err(self.error(format!("{:?} is not a reference type", other))),
        }
    }

    fn val_type(&mut self) -> ParseResult<ValType> {
        let token = self.expect("a value type")?;
        let shorthand = |heap| ValType::Ref(RefType { nullable: true, heap });
        Ok(match token {
            "i32" => ValType::I32,
            "i64" => ValType::I64,
            "f32" => ValType::F32,
            "f64" => ValType::F64,
            "v128" => ValType::V128,
            "funcref" => shorthand(HeapType::Func),
            "externref" => shorthand(HeapType::Extern),
            "anyref" => shorthand(HeapType::Any),
            "eqref" => shorthand(HeapType::Eq),
            "i31ref" => shorthand(HeapType::I31),
            "structref" => shorthand(HeapType::Struct),
            "arrayref" => shorthand(HeapType::Array),
            "nullref" => shorthand(HeapType::None),
            "(" => {
                if !self.eat("ref") {
                    return Err(self.error("expected 'ref' after '('"));
                }
                let nullable = self.eat("null");
                let heap = self.heap_type()?;
                if !self.eat(")") {
                    return Err(self.error("expected ')'"));
                }
                ValType::Ref(RefType { nullable, heap })
            }
            other => return Err(self.error(format!("unknown value type '{}'", other))),
        })
    }

    fn storage_type(&mut self) -> ParseResult<StorageType> {
        match self.peek() {
            Some("i8") => {
                self.pos += 1;
                Ok(StorageType::I8)
            }
            Some("i16") => {
                self.pos += 1;
                Ok(StorageType::I16)
            }
            _ => Ok(StorageType::Val(self.val_type()?)),
        }
    }

    fn field_type(&mut self) -> ParseResult<FieldType> {
        let mutable = self.eat("mut");
        Ok(FieldType { storage: self.storage_type()?, mutable })
    }

    fn block_type(&mut self) -> ParseResult<BlockType> {
        match self.peek() {
            None => Ok(BlockType::Empty),
            Some(token) if token.starts_with("type=") => {
                self.pos += 1;
                parse_unsigned(&token[5..])
                    .and_then(|v| u32::try_from(v).ok())
                    .map(BlockType::Index)
                    .ok_or_else(|| self.error(format!("bad block type '{}'", token)))
            }
            Some(_) => Ok(BlockType::Value(self.val_type()?)),
        }
    }

    /// `key=value` immediate, if present.
    fn keyed(&mut self, key: &str) -> ParseResult<Option<u64>> {
        let Some(token) = self.peek() else {
            return Ok(None);
        };
        let Some(value) = token.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')) else {
            return Ok(None);
        };
        self.pos += 1;
        parse_unsigned(value)
            .map(Some)
            .ok_or_else(|| self.error(format!("bad {} '{}'", key, value)))
    }

    fn memarg(&mut self, natural_align: u32) -> ParseResult<MemArg> {
        let offset = self.keyed("offset")?.unwrap_or(0);
        let align = match self.keyed("align")? {
            Some(bytes) if bytes.is_power_of_two() => bytes.trailing_zeros(),
            Some(bytes) => return Err(self.error(format!("alignment {} is not a power of two", bytes))),
            None => natural_align,
        };
        let offset = u32::try_from(offset).map_err(|_| self.error("offset out of range"))?;
        Ok(MemArg { offset, align })
    }
}

fn parse_unsigned(token: &str) -> Option<u64> {
    let token = token.replace('_', "");
    match token.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}

fn parse_signed(token: &str) -> Option<i64> {
    match token.strip_prefix('-') {
        Some(rest) => parse_unsigned(rest).map(|v| (v as i64).wrapping_neg()),
        None => parse_unsigned(token).map(|v| v as i64),
    }
}

fn num_type(prefix: &str) -> Option<NumType> {
    Some(match prefix {
        "i32" => NumType::I32,
        "i64" => NumType::I64,
        "f32" => NumType::F32,
        "f64" => NumType::F64,
        _ => return None,
    })
}

/// Numeric mnemonic such as `i32.add` or `f64.convert_i32_u`.
fn numeric(prefix: &str, name: &str) -> Option<NumericOp> {
    let ty = num_type(prefix)?;
    let float = ty.is_float();
    let binary = |op| Some(NumericOp::Binary(ty, op));
    let unary = |op| Some(NumericOp::Unary(ty, op));
    let compare = |op| Some(NumericOp::Compare(ty, op));
    let convert = |from, op| Some(NumericOp::Convert { from, to: ty, op });

    match (float, name) {
        (_, "add") => binary(BinaryOp::Add),
        (_, "sub") => binary(BinaryOp::Sub),
        (_, "mul") => binary(BinaryOp::Mul),
        (true, "div") | (false, "div_s") => binary(BinaryOp::Div),
        (false, "div_u") => binary(BinaryOp::UDiv),
        (false, "rem_s") => binary(BinaryOp::Mod),
        (false, "rem_u") => binary(BinaryOp::UMod),
        (false, "and") => binary(BinaryOp::BitAnd),
        (false, "or") => binary(BinaryOp::BitOr),
        (false, "xor") => binary(BinaryOp::BitXor),
        (false, "shl") => binary(BinaryOp::Shl),
        (false, "shr_s") => binary(BinaryOp::SShr),
        (false, "shr_u") => binary(BinaryOp::ZShr),
        (false, "rotl") => binary(BinaryOp::RotL),
        (false, "rotr") => binary(BinaryOp::RotR),
        (true, "min") => binary(BinaryOp::FMin),
        (true, "max") => binary(BinaryOp::FMax),
        (true, "copysign") => binary(BinaryOp::CopySign),

        (false, "clz") => unary(UnaryOp::Clz),
        (false, "ctz") => unary(UnaryOp::Ctz),
        (false, "popcnt") => unary(UnaryOp::Popcnt),
        (true, "neg") => unary(UnaryOp::Neg),
        (true, "abs") => unary(UnaryOp::Abs),
        (true, "sqrt") => unary(UnaryOp::Sqrt),
        (true, "ceil") => unary(UnaryOp::Ceil),
        (true, "floor") => unary(UnaryOp::Floor),
        (true, "trunc") => unary(UnaryOp::FTrunc),
        (true, "nearest") => unary(UnaryOp::Nearest),

        (false, "eqz") => Some(NumericOp::Eqz(ty)),
        (_, "eq") => compare(CompareOp::Equal),
        (_, "ne") => compare(CompareOp::NotEqual),
        (true, "lt") | (false, "lt_s") => compare(CompareOp::LessThan),
        (true, "gt") | (false, "gt_s") => compare(CompareOp::GreaterThan),
        (true, "le") | (false, "le_s") => compare(CompareOp::LessEqual),
        (true, "ge") | (false, "ge_s") => compare(CompareOp::GreaterEqual),
        (false, "lt_u") => compare(CompareOp::Below),
        (false, "gt_u") => compare(CompareOp::Above),
        (false, "le_u") => compare(CompareOp::BelowEqual),
        (false, "ge_u") => compare(CompareOp::AboveEqual),

        (false, "wrap_i64") => convert(NumType::I64, ConvertOp::Trunc),
        (false, "extend_i32_s") if ty == NumType::I64 => convert(NumType::I32, ConvertOp::SExt32),
        (false, "extend_i32_u") if ty == NumType::I64 => convert(NumType::I32, ConvertOp::ZExt32),
        (false, "extend8_s") => convert(ty, ConvertOp::SExt8),
        (false, "extend16_s") => convert(ty, ConvertOp::SExt16),
        (false, "extend32_s") if ty == NumType::I64 => convert(ty, ConvertOp::SExt32),
        (true, "demote_f64") if ty == NumType::F32 => convert(NumType::F64, ConvertOp::FloatToFloat),
        (true, "promote_f32") if ty == NumType::F64 => convert(NumType::F32, ConvertOp::FloatToFloat),
        (true, "reinterpret_i32") if ty == NumType::F32 => convert(NumType::I32, ConvertOp::BitwiseCast),
        (true, "reinterpret_i64") if ty == NumType::F64 => convert(NumType::I64, ConvertOp::BitwiseCast),
        (false, "reinterpret_f32") if ty == NumType::I32 => convert(NumType::F32, ConvertOp::BitwiseCast),
        (false, "reinterpret_f64") if ty == NumType::I64 => convert(NumType::F64, ConvertOp::BitwiseCast),
        (true, _) => {
            // convert_i32_s and friends
            let rest = name.strip_prefix("convert_")?;
            let (source, sign) = rest.split_once('_')?;
            let from = num_type(source).filter(|t| !t.is_float())?;
            convert(from, ConvertOp::IntToFloat { signed: sign == "s" })
        }
        (false, _) => {
            // trunc_f32_s, trunc_sat_f64_u and friends
            let (saturating, rest) = match name.strip_prefix("trunc_sat_") {
                Some(rest) => (true, rest),
                None => (false, name.strip_prefix("trunc_")?),
            };
            let (source, sign) = rest.split_once('_')?;
            let from = num_type(source).filter(|t| t.is_float())?;
            let signed = match sign {
                "s" => true,
                "u" => false,
                _ => return None,
            };
            convert(from, ConvertOp::FloatToInt { signed, saturating })
        }
    }
}

fn simd_lane(prefix: &str) -> Option<SimdLane> {
    Some(match prefix {
        "i8x16" => SimdLane::I8x16,
        "i16x8" => SimdLane::I16x8,
        "i32x4" => SimdLane::I32x4,
        "i64x2" => SimdLane::I64x2,
        "f32x4" => SimdLane::F32x4,
        "f64x2" => SimdLane::F64x2,
        _ => return None,
    })
}

fn atomic_op(name: &str) -> Option<AtomicOp> {
    Some(match name {
        "add" => AtomicOp::Add,
        "sub" => AtomicOp::Sub,
        "and" => AtomicOp::And,
        "or" => AtomicOp::Or,
        "xor" => AtomicOp::Xor,
        "xchg" => AtomicOp::Xchg,
        _ => return None,
    })
}

/// Access width in bytes from a `load8_s`-style suffix, or the full width.
fn access_width(ty: ValType, suffix: &str) -> Option<(u8, bool)> {
    let full = ty.to_ir().size_bytes() as u8;
    if suffix.is_empty() {
        return Some((full, false));
    }
    let (bits, signed) = match suffix.split_once('_') {
        Some((bits, "s")) => (bits, true),
        Some((bits, "u")) => (bits, false),
        Some(_) => return None,
        None => (suffix, false),
    };
    let width = bits.parse::<u8>().ok()? / 8;
    (width > 0 && width < full).then_some((width, signed))
}

fn parse_instruction(t: &mut Tokens<'_>) -> ParseResult<Instruction> {
    let mnemonic = t.expect("an instruction")?;
    let instruction = match mnemonic {
        "unreachable" => Instruction::Unreachable,
        "nop" => Instruction::Nop,
        "block" => Instruction::Block(t.block_type()?),
        "loop" => Instruction::Loop(t.block_type()?),
        "if" => Instruction::If(t.block_type()?),
        "else" => Instruction::Else,
        "end" => Instruction::End,
        "br" => Instruction::Br(t.u32()?),
        "br_if" => Instruction::BrIf(t.u32()?),
        "br_table" => {
            let mut targets = vec![t.u32()?];
            while t.peek().is_some() {
                targets.push(t.u32()?);
            }
            let default = targets.pop().unwrap_or_default();
            Instruction::BrTable { targets, default }
        }
        "return" => Instruction::Return,
        "br_on_null" => Instruction::BrOnNull(t.u32()?),
        "br_on_non_null" => Instruction::BrOnNonNull(t.u32()?),
        "br_on_cast" | "br_on_cast_fail" => Instruction::BrOnCast {
            depth: t.u32()?,
            to: t.ref_type()?,
            on_fail: mnemonic == "br_on_cast_fail",
        },

        "call" => Instruction::Call(t.u32()?),
        "call_indirect" => Instruction::CallIndirect { type_index: t.u32()?, table_index: t.u32()? },
        "call_ref" => Instruction::CallRef(t.u32()?),
        "return_call" => Instruction::ReturnCall(t.u32()?),
        "return_call_indirect" => {
            Instruction::ReturnCallIndirect { type_index: t.u32()?, table_index: t.u32()? }
        }
        "return_call_ref" => Instruction::ReturnCallRef(t.u32()?),

        "try" => Instruction::Try(t.block_type()?),
        "catch" => Instruction::Catch(t.u32()?),
        "catch_all" => Instruction::CatchAll,
        "delegate" => Instruction::Delegate(t.u32()?),
        "throw" => Instruction::Throw(t.u32()?),
        "rethrow" => Instruction::Rethrow(t.u32()?),

        "drop" => Instruction::Drop,
        "select" => Instruction::Select,
        "local.get" => Instruction::LocalGet(t.u32()?),
        "local.set" => Instruction::LocalSet(t.u32()?),
        "local.tee" => Instruction::LocalTee(t.u32()?),
        "global.get" => Instruction::GlobalGet(t.u32()?),
        "global.set" => Instruction::GlobalSet(t.u32()?),
        "table.get" => Instruction::TableGet(t.u32()?),
        "table.set" => Instruction::TableSet(t.u32()?),
        "table.size" => Instruction::TableSize(t.u32()?),
        "table.grow" => Instruction::TableGrow(t.u32()?),

        "memory.size" => Instruction::MemorySize,
        "memory.grow" => Instruction::MemoryGrow,
        "memory.fill" => Instruction::MemoryFill,
        "memory.copy" => Instruction::MemoryCopy,
        "memory.atomic.wait32" => Instruction::AtomicWait { ty: ValType::I32, memarg: t.memarg(2)? },
        "memory.atomic.wait64" => Instruction::AtomicWait { ty: ValType::I64, memarg: t.memarg(3)? },
        "memory.atomic.notify" => Instruction::AtomicNotify(t.memarg(2)?),
        "atomic.fence" => Instruction::AtomicFence,

        "i32.const" => {
            let token = t.expect("an i32")?;
            let v = parse_signed(token)
                .filter(|&v| v >= i32::MIN as i64 && v <= u32::MAX as i64)
                .ok_or_else(|| t.error(format!("bad i32 '{}'", token)))?;
            Instruction::I32Const(v as i32)
        }
        "i64.const" => {
            let token = t.expect("an i64")?;
            let v = parse_signed(token).ok_or_else(|| t.error(format!("bad i64 '{}'", token)))?;
            Instruction::I64Const(v)
        }
        "f32.const" => {
            let token = t.expect("an f32")?;
            let v: f32 = token.parse().map_err(|_| t.error(format!("bad f32 '{}'", token)))?;
            Instruction::F32Const(v.to_bits())
        }
        "f64.const" => {
            let token = t.expect("an f64")?;
            let v: f64 = token.parse().map_err(|_| t.error(format!("bad f64 '{}'", token)))?;
            Instruction::F64Const(v.to_bits())
        }
        "v128.const" => {
            let token = t.expect("a v128")?;
            let bits = token
                .strip_prefix("0x")
                .and_then(|hex| u128::from_str_radix(&hex.replace('_', ""), 16).ok())
                .ok_or_else(|| t.error(format!("bad v128 '{}'", token)))?;
            Instruction::V128Const(bits)
        }

        "ref.null" => Instruction::RefNull(t.heap_type()?),
        "ref.is_null" => Instruction::RefIsNull,
        "ref.func" => Instruction::RefFunc(t.u32()?),
        "ref.as_non_null" => Instruction::RefAsNonNull,
        "ref.eq" => Instruction::RefEq,
        "ref.test" => Instruction::RefTest(t.ref_type()?),
        "ref.cast" => Instruction::RefCast(t.ref_type()?),
        "ref.i31" => Instruction::RefI31,
        "i31.get_s" => Instruction::I31Get { signed: true },
        "i31.get_u" => Instruction::I31Get { signed: false },
        "struct.new" => Instruction::StructNew(t.u32()?),
        "struct.get" | "struct.get_s" | "struct.get_u" => Instruction::StructGet {
            type_index: t.u32()?,
            field: t.u32()?,
            signed: mnemonic == "struct.get_s",
        },
        "struct.set" => Instruction::StructSet { type_index: t.u32()?, field: t.u32()? },
        "array.new" => Instruction::ArrayNew(t.u32()?),
        "array.get" | "array.get_s" | "array.get_u" => Instruction::ArrayGet {
            type_index: t.u32()?,
            signed: mnemonic == "array.get_s",
        },
        "array.set" => Instruction::ArraySet(t.u32()?),
        "array.len" => Instruction::ArrayLen,

        "v128.and" => Instruction::Simd(SimdOp::Bitwise(BinaryOp::BitAnd)),
        "v128.or" => Instruction::Simd(SimdOp::Bitwise(BinaryOp::BitOr)),
        "v128.xor" => Instruction::Simd(SimdOp::Bitwise(BinaryOp::BitXor)),
        "v128.any_true" => Instruction::Simd(SimdOp::AnyTrue),

        other => return parse_typed_instruction(t, other),
    };
    Ok(instruction)
}

/// Mnemonics of the form `<type>.<operation>`.
fn parse_typed_instruction(t: &mut Tokens<'_>, mnemonic: &str) -> ParseResult<Instruction> {
    let line = t.line;
    let unknown = || ParseError { line, message: format!("unknown instruction '{}'", mnemonic) };
    let (prefix, name) = mnemonic.split_once('.').ok_or_else(unknown)?;

    if let Some(lane) = simd_lane(prefix) {
        let op = match name {
            "splat" => SimdOp::Splat(lane),
            "extract_lane" | "extract_lane_s" | "extract_lane_u" => SimdOp::ExtractLane {
                lane,
                index: t.u8()?,
                signed: name == "extract_lane_s",
            },
            "replace_lane" => SimdOp::ReplaceLane { lane, index: t.u8()? },
            "add" => SimdOp::Lanewise { lane, op: BinaryOp::Add },
            "sub" => SimdOp::Lanewise { lane, op: BinaryOp::Sub },
            "mul" => SimdOp::Lanewise { lane, op: BinaryOp::Mul },
            "min" if lane.is_float() => SimdOp::Lanewise { lane, op: BinaryOp::FMin },
            "max" if lane.is_float() => SimdOp::Lanewise { lane, op: BinaryOp::FMax },
            _ => return Err(unknown()),
        };
        return Ok(Instruction::Simd(op));
    }

    let ty = match prefix {
        "v128" => ValType::V128,
        _ => num_type(prefix).ok_or_else(unknown)?.val_type(),
    };
    let full = ty.to_ir().size_bytes();
    let natural = |width: u8| (width as u32).trailing_zeros();

    if let Some(suffix) = name.strip_prefix("load") {
        let (width, signed) = access_width(ty, suffix).ok_or_else(unknown)?;
        let memarg = t.memarg(natural(width))?;
        return Ok(Instruction::Load { ty, width, signed, memarg });
    }
    if let Some(suffix) = name.strip_prefix("store") {
        let (width, _) = access_width(ty, suffix).ok_or_else(unknown)?;
        let memarg = t.memarg(natural(width))?;
        return Ok(Instruction::Store { ty, width, memarg });
    }
    if let Some(atomic) = name.strip_prefix("atomic.") {
        if let Some(suffix) = atomic.strip_prefix("load") {
            let (width, _) = access_width(ty, suffix).ok_or_else(unknown)?;
            return Ok(Instruction::AtomicLoad { ty, width, memarg: t.memarg(natural(width))? });
        }
        if let Some(suffix) = atomic.strip_prefix("store") {
            let (width, _) = access_width(ty, suffix).ok_or_else(unknown)?;
            return Ok(Instruction::AtomicStore { ty, width, memarg: t.memarg(natural(width))? });
        }
        // rmw.add, rmw8.add_u, rmw16.cmpxchg_u
        let rmw = atomic.strip_prefix("rmw").ok_or_else(unknown)?;
        let (bits, op) = rmw.split_once('.').ok_or_else(unknown)?;
        let op = op.strip_suffix("_u").unwrap_or(op);
        let width = if bits.is_empty() {
            full as u8
        } else {
            bits.parse::<u8>().map_err(|_| unknown())? / 8
        };
        let memarg = t.memarg(natural(width))?;
        if op == "cmpxchg" {
            return Ok(Instruction::AtomicCmpxchg { ty, width, memarg });
        }
        let op = atomic_op(op).ok_or_else(unknown)?;
        return Ok(Instruction::AtomicRmw { op, ty, width, memarg });
    }

    numeric(prefix, name).map(Instruction::Numeric).ok_or_else(unknown)
}

fn parse_function_type(t: &mut Tokens<'_>) -> ParseResult<FunctionType> {
    let mut params = Vec::new();
    while t.peek().is_some_and(|tok| tok != "->") {
        params.push(t.val_type()?);
    }
    let mut results = Vec::new();
    if t.eat("->") {
        while t.peek().is_some() {
            results.push(t.val_type()?);
        }
    }
    Ok(FunctionType::new(params, results))
}

fn parse_directive(module: &mut ModuleInformation, t: &mut Tokens<'_>, keyword: &str) -> ParseResult<()> {
    match keyword {
        "type" => {
            let definition = match t.expect("func, struct or array")? {
                "func" => TypeDefinition::Func(parse_function_type(t)?),
                "struct" => {
                    let mut fields = Vec::new();
                    while t.peek().is_some() {
                        fields.push(t.field_type()?);
                    }
                    TypeDefinition::Struct(StructType::new(fields))
                }
                "array" => TypeDefinition::Array(ArrayType { element: t.field_type()? }),
                other => return Err(t.error(format!("unknown type kind '{}'", other))),
            };
            module.types.push(definition);
        }
        "import" => {
            if !module.functions.is_empty() {
                return Err(t.error("imports must precede function definitions"));
            }
            if !t.eat("func") {
                return Err(t.error("only function imports are supported"));
            }
            module.imported_functions.push(t.u32()?);
        }
        "memory" => {
            let initial_pages = t.u32()?;
            let maximum_pages = t.keyed("max")?.map(|v| v as u32);
            let shared = t.eat("shared");
            module.memory = Some(MemoryInfo { initial_pages, maximum_pages, shared });
        }
        "table" => {
            let element = t.ref_type()?;
            let initial = t.u32()?;
            let maximum = t.keyed("max")?.map(|v| v as u32);
            module.tables.push(TableInfo { element, initial, maximum });
        }
        "global" => {
            let ty = t.val_type()?;
            let mutable = t.eat("mut");
            module.globals.push(GlobalInfo { ty, mutable });
        }
        "tag" => {
            let type_index = t.u32()?;
            module.tags.push(TagInfo { type_index });
        }
        "func" => {
            let type_index = t.u32()?;
            module.functions.push(FunctionBody { type_index, locals: Vec::new(), code: Vec::new() });
        }
        other => return Err(t.error(format!("unknown directive '{}'", other))),
    }
    t.finish()
}

/// Read a whole module listing.
pub fn parse_module(text: &str) -> ParseResult<ModuleInformation> {
    let mut module = ModuleInformation::default();

    for (number, raw) in text.lines().enumerate() {
        let line = raw.split(';').next().unwrap_or("");
        let tokens = tokenize(line);
        if tokens.is_empty() {
            continue;
        }
        let mut t = Tokens { line: number + 1, tokens, pos: 0 };
        let indented = raw.starts_with(char::is_whitespace);

        if !indented {
            let keyword = t.expect("a directive")?;
            parse_directive(&mut module, &mut t, keyword)?;
            continue;
        }

        let Some(body) = module.functions.last_mut() else {
            return Err(t.error("instruction outside a function"));
        };
        if t.eat("local") {
            if !body.code.is_empty() {
                return Err(t.error("locals must precede the first instruction"));
            }
            while t.peek().is_some() {
                body.locals.push(t.val_type()?);
            }
            continue;
        }
        let instruction = parse_instruction(&mut t)?;
        t.finish()?;
        body.code.push(instruction);
    }

    module.publish_callees();
    log::debug!(
        "parsed module: {} types, {} imports, {} functions",
        module.types.len(),
        module.imported_functions.len(),
        module.functions.len()
    );
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_declarations_and_body() {
        let module = parse_module(
            "type func i32 -> i32 ; unary\n\
             type struct mut i8 (ref null 0)\n\
             import func 0\n\
             memory 1 max=4\n\
             global i64 mut\n\
             func 0\n\
             \x20 local f64\n\
             \x20 local.get 0\n\
             \x20 i32.load8_s offset=4\n\
             \x20 i32.const -1\n\
             \x20 i32.ge_u\n\
             \x20 end\n",
        )
        .unwrap();

        assert_eq!(module.types.len(), 2);
        assert_eq!(module.imported_functions, vec![0]);
        assert_eq!(module.memory.map(|m| m.maximum_pages), Some(Some(4)));
        assert!(module.globals[0].mutable);
        let body = &module.functions[0];
        assert_eq!(body.locals, vec![ValType::F64]);
        assert_eq!(
            body.code,
            vec![
                Instruction::LocalGet(0),
                Instruction::Load {
                    ty: ValType::I32,
                    width: 1,
                    signed: true,
                    memarg: MemArg { offset: 4, align: 0 },
                },
                Instruction::I32Const(-1),
                Instruction::Numeric(NumericOp::Compare(NumType::I32, CompareOp::AboveEqual)),
                Instruction::End,
            ]
        );
        if let TypeDefinition::Struct(s) = &module.types[1] {
            assert_eq!(s.fields[1].storage, StorageType::Val(ValType::Ref(RefType {
                nullable: true,
                heap: HeapType::Concrete(0),
            })));
        } else {
            panic!("expected a struct type");
        }
    }

    #[test]
    fn test_parse_conversions_and_atomics() {
        let mut t = Tokens { line: 1, tokens: tokenize("i64.trunc_sat_f32_u"), pos: 0 };
        assert_eq!(
            parse_instruction(&mut t).unwrap(),
            Instruction::Numeric(NumericOp::Convert {
                from: NumType::F32,
                to: NumType::I64,
                op: ConvertOp::FloatToInt { signed: false, saturating: true },
            })
        );
        let mut t = Tokens { line: 1, tokens: tokenize("i32.atomic.rmw8.xchg_u offset=8"), pos: 0 };
        assert_eq!(
            parse_instruction(&mut t).unwrap(),
            Instruction::AtomicRmw {
                op: AtomicOp::Xchg,
                ty: ValType::I32,
                width: 1,
                memarg: MemArg { offset: 8, align: 0 },
            }
        );
        let mut t = Tokens { line: 1, tokens: tokenize("br_table 2 0 1"), pos: 0 };
        assert_eq!(
            parse_instruction(&mut t).unwrap(),
            Instruction::BrTable { targets: vec![2, 0], default: 1 }
        );
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse_module("type func -> i32\nfunc 0\n  i32.bogus\n").unwrap_err();
        assert_eq!(err.line, 3);
        let err = parse_module("  nop\n").unwrap_err();
        assert_eq!(err.line, 1);
        let err = parse_module("func 0\n  local.get\n").unwrap_err();
        assert_eq!(err.line, 2);
    }
}
