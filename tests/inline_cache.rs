//! Inline cache stubs against reserved sites and a shared patch region.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, Register};
use std::sync::Arc;
use std::thread;
use wasmjit::core::register_file::allocatable_gp_registers;
use wasmjit::ic::layout::{
    CONTIGUOUS_SHAPE, DOUBLE_SHAPE, FIRST_OUT_OF_LINE_OFFSET, INLINE_STORAGE_OFFSET, IS_ARRAY,
    SLOW_PUT_ARRAY_STORAGE_SHAPE,
};
use wasmjit::ic::{
    can_generate_self_property_replace, generate_array_length, generate_self_in_access,
    generate_self_property_access, generate_self_property_replace, generate_string_length,
    is_cacheable_array_length, AccessType, InlineStub, PatchError, PatchRegion, PropertyOffset,
    StructureId, StubSite,
};
use wasmjit::AsmReg;

const REGION_BASE: u64 = 0x7000_0000;
const SLOW_PATH: u64 = 0x7000_8000;

fn site(access: AccessType, start: u64, inline_size: usize) -> StubSite {
    let mut site = StubSite::new(access, AsmReg::RSI, AsmReg::RAX);
    site.start = start;
    site.inline_size = inline_size;
    site.slow_path_start = SLOW_PATH;
    site
}

/// Instructions of the stub proper, without the padding.
fn decode(stub: &InlineStub, start: u64) -> Vec<Instruction> {
    let bytes = &stub.code[..stub.emitted_size];
    Decoder::with_ip(64, bytes, start, DecoderOptions::NONE).iter().collect()
}

fn every_stub(site: &StubSite) -> Vec<InlineStub> {
    let out_of_line = PropertyOffset(FIRST_OUT_OF_LINE_OFFSET + 5);
    [
        generate_self_property_access(site, StructureId(11), PropertyOffset(3)),
        generate_self_property_access(site, StructureId(11), out_of_line),
        generate_self_property_replace(site, StructureId(11), PropertyOffset(3)),
        generate_self_property_replace(site, StructureId(11), out_of_line),
        generate_array_length(site, IS_ARRAY | DOUBLE_SHAPE),
        generate_string_length(site),
        generate_self_in_access(site, StructureId(11)),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[test]
fn stubs_always_fill_the_reservation_exactly() {
    let mut produced = 0;
    for budget in 0..80 {
        for access in [AccessType::GetById, AccessType::PutById, AccessType::InById] {
            let site = site(access, REGION_BASE + 0x40, budget);
            for stub in every_stub(&site) {
                assert_eq!(stub.len(), budget, "{}", stub.name);
                assert!(stub.emitted_size <= budget);
                assert!(stub.code[stub.emitted_size..].iter().all(|&b| b == 0x90));
                produced += 1;
            }
        }
    }
    // generous budgets fit every variant
    assert!(produced > 0);
    let roomy = site(AccessType::GetById, REGION_BASE, 64);
    assert_eq!(every_stub(&roomy).len(), 7);
}

#[test]
fn property_access_checks_structure_then_loads() {
    let site = site(AccessType::GetById, REGION_BASE + 0x100, 32);
    let stub = generate_self_property_access(&site, StructureId(0xbeef), PropertyOffset(2)).unwrap();
    let instructions = decode(&stub, site.start);

    assert_eq!(instructions[0].code(), Code::Cmp_rm32_imm32);
    assert_eq!(instructions[0].memory_base(), Register::RSI);
    assert_eq!(instructions[0].immediate32(), 0xbeef);
    assert_eq!(instructions[1].mnemonic(), Mnemonic::Jne);
    assert_eq!(instructions[1].near_branch_target(), SLOW_PATH);

    let load = instructions.last().unwrap();
    assert_eq!(load.code(), Code::Mov_r64_rm64);
    assert_eq!(load.op0_register(), Register::RAX);
    assert_eq!(load.memory_displacement64(), (INLINE_STORAGE_OFFSET + 16) as u64);
}

#[test]
fn out_of_line_replace_declines_without_a_free_register() {
    let offset = PropertyOffset(FIRST_OUT_OF_LINE_OFFSET);
    let mut site = site(AccessType::PutById, REGION_BASE, 48);
    let stub = generate_self_property_replace(&site, StructureId(4), offset).unwrap();
    // butterfly load into a temporary that is neither operand
    let butterfly = decode(&stub, site.start)[2];
    assert_eq!(butterfly.code(), Code::Mov_r64_rm64);
    assert!(![Register::RSI, Register::RAX].contains(&butterfly.op0_register()));

    site.used_registers = allocatable_gp_registers();
    assert!(!can_generate_self_property_replace(&site, offset));
    assert!(generate_self_property_replace(&site, StructureId(4), offset).is_none());
    assert!(!is_cacheable_array_length(&site, IS_ARRAY | CONTIGUOUS_SHAPE));
    assert!(generate_string_length(&site).is_none());
}

#[test]
fn array_length_rejects_array_storage() {
    let site = site(AccessType::GetById, REGION_BASE, 48);
    assert!(generate_array_length(&site, IS_ARRAY | SLOW_PUT_ARRAY_STORAGE_SHAPE).is_none());
    let stub = generate_array_length(&site, IS_ARRAY | CONTIGUOUS_SHAPE).unwrap();
    let instructions = decode(&stub, site.start);
    let compare = instructions
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Cmp)
        .unwrap();
    assert_eq!(compare.immediate(1), (IS_ARRAY | CONTIGUOUS_SHAPE) as u64);
    // boxed with the number tag register
    assert_eq!(instructions.last().unwrap().mnemonic(), Mnemonic::Or);
}

#[test]
fn linked_stub_can_be_repointed_at_another_structure() {
    let region = PatchRegion::new(REGION_BASE, 0x200);
    let roomy = site(AccessType::GetById, REGION_BASE + 0x80, 64);
    let site = site(AccessType::InById, REGION_BASE + 0x80, 24);
    let stub = generate_self_in_access(&site, StructureId(5)).unwrap();

    region.link(&site, &stub).unwrap();
    region.repatch_structure(&site, &stub, 6).unwrap();
    assert_eq!(region.version(), 2);

    let bytes = region.read(site.start, site.inline_size).unwrap();
    let mut decoder = Decoder::with_ip(64, &bytes, site.start, DecoderOptions::NONE);
    assert_eq!(decoder.decode().immediate32(), 6);

    // the bytes around the site are untouched
    assert!(region.read(REGION_BASE, 0x80).unwrap().iter().all(|&b| b == 0xcc));

    let string = generate_string_length(&roomy).unwrap();
    assert!(matches!(
        region.repatch_structure(&site, &string, 1),
        Err(PatchError::NoStructureCheck)
    ));
    let mut elsewhere = site.clone();
    elsewhere.start = REGION_BASE + 0x1f0;
    assert!(matches!(
        region.link(&elsewhere, &stub),
        Err(PatchError::OutOfRange { .. })
    ));
}

#[test]
fn readers_see_whole_stubs_while_writers_repatch() {
    let region = Arc::new(PatchRegion::new(REGION_BASE, 0x100));
    let site = site(AccessType::GetById, REGION_BASE + 0x20, 32);
    let stub = generate_self_property_access(&site, StructureId(0), PropertyOffset(1)).unwrap();
    region.link(&site, &stub).unwrap();
    let immediate = stub.structure_immediate.unwrap();

    let writer = {
        let region = Arc::clone(&region);
        let site = site.clone();
        let stub = stub.clone();
        thread::spawn(move || {
            for id in 1..=500u32 {
                region.repatch_structure(&site, &stub, (id % 255) * 0x0101_0101).unwrap();
            }
        })
    };

    for _ in 0..500 {
        let bytes = region.read(site.start, site.inline_size).unwrap();
        let id = u32::from_le_bytes(bytes[immediate..immediate + 4].try_into().unwrap());
        // every published immediate repeats one byte four times
        let [a, b, c, d] = id.to_le_bytes();
        assert!(a == b && b == c && c == d, "torn immediate {:#x}", id);
        assert_eq!(&bytes[..immediate], &stub.code[..immediate]);
    }
    writer.join().unwrap();
    assert_eq!(region.version(), 501);
}
