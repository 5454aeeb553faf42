//! Integration tests for the instrumentation engine.
//!
//! Tests translate-on-first-reach, event handling and the control-flow
//! graph it builds.

#![cfg(feature = "policy")]

mod common;

use std::sync::Arc;
use std::thread;

use axdbi::block::{BlockFlags, Edge, EdgeKind};
use axdbi::config::EngineConfig;
use axdbi::engine::{Engine, Error};
use axdbi::policy::{ExecEnv, Hook, InterruptHandled, InterruptVector, Placement, Policy};

use common::{CACHE_BASE, MockInsn, RecordingCodeGen};

const TEXT_START: u64 = 0x40_0000;
const TEXT_END: u64 = 0x50_0000;

const CALLER: u64 = 0x40_1000;
const CALLEE: u64 = 0x40_2000;
/// Return address of the call in `CALLER`.
const AFTER_CALL: u64 = CALLER + 8;

fn engine() -> Engine {
    Engine::new(EngineConfig::new().with_num_cpus(2).with_app_text(TEXT_START, TEXT_END)).unwrap()
}

fn caller_block() -> [MockInsn; 2] {
    [MockInsn::plain(CALLER), MockInsn::call(CALLER + 4, CALLEE)]
}

fn callee_block() -> [MockInsn; 2] {
    [MockInsn::load(CALLEE), MockInsn::ret(CALLEE + 4)]
}

fn after_call_block() -> [MockInsn; 1] {
    [MockInsn::ret(AFTER_CALL)]
}

// =============================================================================
// Translation Tests
// =============================================================================

#[test]
fn test_translate_uses_root_policy() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    let block = engine.translate(CALLER, ExecEnv::App, &caller_block(), &mut codegen).unwrap();

    assert_eq!(block.policy(), Policy::Root);
    assert_eq!(block.native_pc(), CALLER);
    assert_eq!(block.cache_pc(), CACHE_BASE + CALLER);
    assert!(block.flags().contains(BlockFlags::ROOT));
    assert_eq!(codegen.emitted, [CALLER]);
    assert_eq!(
        codegen.hooks(),
        [Hook::EnterFunction, Hook::CallApp, Hook::AfterFunction]
    );
}

#[test]
fn test_translate_records_successor_policies() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    engine.translate(CALLER, ExecEnv::App, &caller_block(), &mut codegen).unwrap();

    assert_eq!(engine.target_policy(CALLEE), Some(Policy::Entry));
    assert_eq!(engine.target_policy(AFTER_CALL), Some(Policy::Exit));

    let callee = engine.translate(CALLEE, ExecEnv::App, &callee_block(), &mut codegen).unwrap();
    assert_eq!(callee.policy(), Policy::Entry);
    let after = engine.translate(AFTER_CALL, ExecEnv::App, &after_call_block(), &mut codegen).unwrap();
    assert_eq!(after.policy(), Policy::Exit);
}

#[test]
fn test_first_discovery_wins() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    engine.translate(CALLER, ExecEnv::App, &caller_block(), &mut codegen).unwrap();

    // A later jump to the callee does not demote it.
    let jumper = [MockInsn::jmp(0x40_3000, CALLEE)];
    engine.translate(0x40_3000, ExecEnv::App, &jumper, &mut codegen).unwrap();
    assert_eq!(engine.target_policy(CALLEE), Some(Policy::Entry));
}

#[test]
fn test_translate_returns_existing_block() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    let first = engine.translate(CALLER, ExecEnv::App, &caller_block(), &mut codegen).unwrap();
    let second = engine.translate(CALLER, ExecEnv::App, &caller_block(), &mut codegen).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(codegen.emitted.len(), 1);
    assert_eq!(engine.num_blocks(), 1);
}

#[test]
fn test_trampolines_are_materialized_once() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    for pc in [0x40_4000u64, 0x40_5000, 0x40_6000] {
        engine
            .translate_with(Policy::Exit, pc, ExecEnv::App, &[MockInsn::plain(pc)], &mut codegen)
            .unwrap();
    }
    assert_eq!(codegen.materialized, [Hook::EnterBasicBlock]);
    assert_eq!(codegen.inserted.len(), 3);
    let entry = codegen.inserted[0].1;
    assert!(codegen.inserted.iter().all(|(_, e)| *e == entry));
}

#[test]
fn test_translate_rejects_bad_input() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    let empty: [MockInsn; 0] = [];

    assert_eq!(
        engine.translate(CALLER, ExecEnv::App, &empty, &mut codegen).unwrap_err(),
        Error::EmptyBlock { pc: CALLER }
    );
    assert_eq!(
        engine.translate(0, ExecEnv::App, &caller_block(), &mut codegen).unwrap_err(),
        Error::NullAddress
    );
    assert_eq!(engine.num_blocks(), 0);
}

#[test]
fn test_translated_pc_lookup() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    assert_eq!(engine.translated_pc(CALLER), None);

    engine.translate(CALLER, ExecEnv::App, &caller_block(), &mut codegen).unwrap();
    assert_eq!(engine.translated_pc(CALLER), Some(CACHE_BASE + CALLER));
    // Second lookup hits the CPU-private table.
    assert_eq!(engine.translated_pc(CALLER), Some(CACHE_BASE + CALLER));
}

#[test]
fn test_concurrent_translation_has_one_winner() {
    let engine = Arc::new(engine());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut codegen = RecordingCodeGen::new();
                engine
                    .translate(CALLER, ExecEnv::App, &caller_block(), &mut codegen)
                    .unwrap()
            })
        })
        .collect();
    let blocks: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(blocks.iter().all(|b| Arc::ptr_eq(b, &blocks[0])));
    assert_eq!(engine.num_blocks(), 1);
    assert!(engine.races_lost() <= 7);
    assert_eq!(engine.block(CALLER).map(|b| b.id()), Some(blocks[0].id()));
}

// =============================================================================
// Event Tests
// =============================================================================

#[test]
fn test_call_and_return_build_edges() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    let caller = engine.translate(CALLER, ExecEnv::App, &caller_block(), &mut codegen).unwrap();
    let mut callee_gen = RecordingCodeGen::new();
    let callee = engine.translate(CALLEE, ExecEnv::App, &callee_block(), &mut callee_gen).unwrap();
    let after = engine.translate(AFTER_CALL, ExecEnv::App, &after_call_block(), &mut codegen).unwrap();

    // The callee exits through its return.
    assert!(callee.flags().contains(BlockFlags::FUNCTION_ENTRY | BlockFlags::FUNCTION_EXIT));
    let exit = callee_gen
        .inserted
        .iter()
        .find(|(c, _)| c.hook == Hook::ExitFunction)
        .map(|(c, _)| (c.index, c.placement));
    assert_eq!(exit, Some((1, Placement::Before)));

    const RUNS: u64 = 5;
    for _ in 0..RUNS {
        engine.dispatch(Hook::EnterFunction, &caller, None);
        engine.dispatch(Hook::CallApp, &caller, None);
        engine.dispatch(Hook::EnterFunction, &callee, None);
        engine.dispatch(Hook::ExitFunction, &callee, None);
        engine.dispatch(Hook::AfterFunction, &caller, None);
        engine.dispatch(Hook::EnterBasicBlock, &after, None);
        engine.dispatch(Hook::ExitFunction, &after, None);
    }

    assert_eq!(caller.counters().executions(), RUNS);
    assert_eq!(callee.counters().executions(), RUNS);
    assert_eq!(caller.counters().snapshot().app_calls, RUNS);

    assert_eq!(
        caller.edges(),
        [Edge { block: callee.id(), kind: EdgeKind::InterOutgoing }]
    );
    assert_eq!(
        after.edges(),
        [Edge { block: caller.id(), kind: EdgeKind::IntraIncoming }]
    );
    assert_eq!(after.function_id(), caller.function_id());
    assert_ne!(callee.function_id(), caller.function_id());
}

#[test]
fn test_edges_spill_to_other_block() {
    let engine = Engine::new(EngineConfig::new().with_num_cpus(1).with_edges(1, 4)).unwrap();
    let mut codegen = RecordingCodeGen::new();
    let a = engine
        .translate_with(Policy::Exit, 0x1000, ExecEnv::App, &[MockInsn::plain(0x1000)], &mut codegen)
        .unwrap();
    let b = engine
        .translate_with(Policy::Exit, 0x2000, ExecEnv::App, &[MockInsn::plain(0x2000)], &mut codegen)
        .unwrap();
    let c = engine
        .translate_with(Policy::Exit, 0x3000, ExecEnv::App, &[MockInsn::plain(0x3000)], &mut codegen)
        .unwrap();

    // a -> c fills c's only slot.
    engine.on_after_function(&a);
    engine.on_enter_basic_block(&c);
    // b -> c goes into b instead.
    engine.on_after_function(&b);
    engine.on_enter_basic_block(&c);

    assert_eq!(c.edges(), [Edge { block: a.id(), kind: EdgeKind::IntraIncoming }]);
    assert_eq!(b.edges(), [Edge { block: c.id(), kind: EdgeKind::IntraOutgoing }]);
}

#[test]
fn test_call_counters() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    let block = engine
        .translate_with(Policy::Exit, CALLER, ExecEnv::App, &[MockInsn::plain(CALLER)], &mut codegen)
        .unwrap();

    engine.dispatch(Hook::CallHost, &block, Some(0xffff_ffff_8100_0000));
    engine.dispatch(Hook::CallIndirect, &block, None);
    engine.dispatch(Hook::FallThrough, &block, None);
    engine.dispatch(Hook::FallThrough, &block, None);

    let counters = block.counters().snapshot();
    assert_eq!(counters.host_calls, 1);
    assert_eq!(counters.indirect_calls, 1);
    assert_eq!(counters.fall_throughs, 2);
}

#[test]
fn test_watched_access_decodes_and_detects_stale() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    let block = engine
        .translate_with(Policy::Watched, CALLER, ExecEnv::App, &[MockInsn::load(CALLER)], &mut codegen)
        .unwrap();
    assert_eq!(codegen.hooks(), [Hook::WatchRead]);

    let heap = 0xffff_8880_2000_0000u64;
    let tagged = engine.watchpoints().encode(heap, 64, CALLER).unwrap();

    assert_eq!(engine.dispatch(Hook::WatchRead, &block, Some(tagged + 8)), heap + 8);
    assert_eq!(engine.dispatch(Hook::WatchWrite, &block, Some(heap)), heap);

    engine.watchpoints().release(tagged).unwrap();
    assert_eq!(engine.on_watched_access(&block, tagged, true), heap);

    let counters = block.counters().snapshot();
    assert_eq!(counters.watched_accesses, 2);
    assert_eq!(counters.stale_accesses, 1);
}

// =============================================================================
// Interrupt Tests
// =============================================================================

#[test]
fn test_interrupts_are_deferred() {
    let engine = engine();
    let mut codegen = RecordingCodeGen::new();
    let block = engine.translate(CALLER, ExecEnv::App, &caller_block(), &mut codegen).unwrap();

    assert_eq!(
        engine.handle_interrupt(Some(&block), InterruptVector::PAGE_FAULT),
        InterruptHandled::Deferred
    );
    assert_eq!(block.counters().snapshot().interrupts, 1);
    assert_eq!(
        engine.handle_interrupt(None, InterruptVector::FIRST_EXTERNAL),
        InterruptHandled::Deferred
    );
}

// =============================================================================
// Initialization Tests
// =============================================================================

#[test]
fn test_init_rejects_invalid_config() {
    let result = axdbi::init(EngineConfig::new().with_global_table_buckets(3));
    assert!(result.is_err());
}

#[test]
fn test_init_builds_engine() {
    let engine = axdbi::init(EngineConfig::new().with_root_policy(Policy::Null)).unwrap();
    let mut codegen = RecordingCodeGen::new();
    let block = engine.translate(CALLER, ExecEnv::App, &caller_block(), &mut codegen).unwrap();
    assert_eq!(block.policy(), Policy::Null);
    assert!(codegen.inserted.is_empty());
}
