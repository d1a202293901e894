mod common;

use std::collections::HashSet;
use common::{device, device_with};
use meridian_rhi::backend::capture::Command;
use meridian_rhi::{
    BufferDesc, DeviceConfigBuilder, Query, QueryData, QueryPoolSizes, QueryType, StaleQueryReuse,
};
use proptest::prelude::*;

#[test]
fn duration_reports_the_timestamp_difference_once_complete() {
    let (capture, device) = device();
    let mut context = device.create_immediate_context().unwrap();
    let mut query = device.create_query("frame", QueryType::Duration);

    assert!(context.begin_query(&mut query));
    assert!(context.end_query(&mut query));
    let fence_value = context.flush().unwrap();
    assert_eq!(context.get_query_data(&query), None);

    let pool = device.query_manager().pool(QueryType::Duration);
    capture.set_query_result(pool, query.slot(0), vec![1_000]);
    capture.set_query_result(pool, query.slot(1), vec![4_500]);
    capture.complete_up_to(fence_value);

    let frequency = device.query_manager().counter_frequency();
    assert_eq!(
        context.get_query_data(&query),
        Some(QueryData::Duration {
            duration: 3_500,
            frequency
        })
    );
}

#[test]
fn timestamp_queries_can_only_end() {
    let (capture, device) = device();
    let mut context = device.create_immediate_context().unwrap();
    let mut query = device.create_query("marker", QueryType::Timestamp);

    assert!(!context.begin_query(&mut query));
    assert!(context.end_query(&mut query));
    context.flush().unwrap();
    assert_eq!(
        capture
            .submitted_commands()
            .iter()
            .filter(|c| matches!(c, Command::WriteTimestamp { .. }))
            .count(),
        1
    );
}

#[test]
fn results_stay_hidden_until_the_submission_with_the_end_completes() {
    let (capture, device) = device();
    let mut context = device.create_immediate_context().unwrap();
    let mut query = device.create_query("visibility", QueryType::BinaryOcclusion);

    assert!(context.begin_query(&mut query));
    assert!(context.end_query(&mut query));
    let submitted = context.flush().unwrap();

    capture.set_query_result(device.query_manager().pool(QueryType::BinaryOcclusion), query.slot(0), vec![7]);
    capture.complete_up_to(submitted - 1);
    assert_eq!(context.get_query_data(&query), None);
    capture.complete_up_to(submitted);
    assert_eq!(
        context.get_query_data(&query),
        Some(QueryData::BinaryOcclusion { any_sample_passed: true })
    );
}

#[test]
fn uploads_between_end_and_flush_do_not_publish_results() {
    let (capture, device) = device();
    let mut context = device.create_immediate_context().unwrap();
    let mut query = device.create_query("marker", QueryType::Timestamp);

    assert!(context.end_query(&mut query));
    capture.set_query_result(device.query_manager().pool(QueryType::Timestamp), query.slot(0), vec![42]);
    device.create_buffer(&BufferDesc::storage("upload", 16), Some(&[1u8; 16])).unwrap();
    capture.complete_all();
    assert_eq!(context.get_query_data(&query), None);

    let fence_value = context.flush().unwrap();
    let carries_end = capture.submissions().iter().any(|s| {
        s.fence_value == fence_value
            && s.command_buffers
                .iter()
                .flat_map(|c| c.commands.iter())
                .any(|c| matches!(c, Command::WriteTimestamp { .. }))
    });
    assert!(carries_end);
    assert_eq!(context.get_query_data(&query), None);

    capture.complete_up_to(fence_value);
    assert_eq!(
        context.get_query_data(&query),
        Some(QueryData::Timestamp {
            counter: 42,
            frequency: device.query_manager().counter_frequency()
        })
    );
}

#[test]
fn duration_spanning_an_upload_waits_for_its_own_submission() {
    let (capture, device) = device();
    let mut context = device.create_immediate_context().unwrap();
    let mut query = device.create_query("span", QueryType::Duration);
    let pool = device.query_manager().pool(QueryType::Duration);

    assert!(context.begin_query(&mut query));
    device.create_buffer(&BufferDesc::storage("upload", 16), Some(&[1u8; 16])).unwrap();
    assert!(context.end_query(&mut query));
    capture.set_query_result(pool, query.slot(0), vec![10]);
    capture.set_query_result(pool, query.slot(1), vec![25]);
    device.create_buffer(&BufferDesc::storage("another upload", 16), Some(&[2u8; 16])).unwrap();
    capture.complete_all();
    assert_eq!(context.get_query_data(&query), None);

    let fence_value = context.flush().unwrap();
    capture.complete_up_to(fence_value);
    assert!(matches!(
        context.get_query_data(&query),
        Some(QueryData::Duration { duration: 15, .. })
    ));
}

#[test]
fn rebegun_query_resets_its_old_slot_on_the_next_flush() {
    let (capture, device) = device();
    let mut context = device.create_immediate_context().unwrap();
    let mut query = device.create_query("occlusion", QueryType::Occlusion);
    let manager = device.query_manager().clone();

    assert!(context.begin_query(&mut query));
    assert!(context.end_query(&mut query));
    context.flush().unwrap();
    let old_slot = query.slot(0);

    assert!(context.begin_query(&mut query));
    assert_ne!(query.slot(0), old_slot);
    assert_eq!(manager.stale_slots(QueryType::Occlusion), vec![old_slot]);
    assert!(context.end_query(&mut query));
    let before = capture.submissions().len();
    context.flush().unwrap();

    assert!(manager.stale_slots(QueryType::Occlusion).is_empty());
    let resets: Vec<_> = capture.submissions()[before..]
        .iter()
        .flat_map(|s| s.command_buffers.iter())
        .flat_map(|c| c.commands.iter())
        .filter_map(|c| match c {
            Command::ResetQueryPool { first, count, .. } => Some((*first, *count)),
            _ => None,
        })
        .collect();
    assert_eq!(resets, vec![(old_slot, 1)]);
}

#[test]
fn exhausted_pool_fails_the_begin() {
    let config = DeviceConfigBuilder::default()
        .query_pool_sizes(QueryPoolSizes::uniform(1))
        .build()
        .unwrap();
    let (_capture, device) = device_with(config);
    let mut context = device.create_immediate_context().unwrap();
    let mut a = device.create_query("a", QueryType::PipelineStatistics);
    let mut b = device.create_query("b", QueryType::PipelineStatistics);

    assert!(context.begin_query(&mut a));
    assert!(context.end_query(&mut a));
    assert!(!context.begin_query(&mut b));
    assert_eq!(context.get_query_data(&b), None);
    context.flush().unwrap();
}

#[derive(Clone, Copy, Debug)]
enum QueryOp {
    Begin(usize),
    End(usize),
    Invalidate(usize),
    Flush,
}

fn query_op(queries: usize) -> impl Strategy<Value = QueryOp> {
    prop_oneof![
        (0..queries).prop_map(QueryOp::Begin),
        (0..queries).prop_map(QueryOp::End),
        (0..queries).prop_map(QueryOp::Invalidate),
        Just(QueryOp::Flush),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every slot is in exactly one place: held by a query, stale or free. Resets put slots at the
    /// end of the free list the reuse order names.
    #[test]
    fn slots_are_never_shared(ops in prop::collection::vec(query_op(3), 1..40), reuse_back in any::<bool>()) {
        const CAPACITY: u32 = 4;
        let reuse = if reuse_back { StaleQueryReuse::Back } else { StaleQueryReuse::Front };
        let config = DeviceConfigBuilder::default()
            .query_pool_sizes(QueryPoolSizes::uniform(CAPACITY))
            .stale_query_reuse(reuse)
            .build()
            .unwrap();
        let (_capture, device) = device_with(config);
        let manager = device.query_manager().clone();
        let mut context = device.create_immediate_context().unwrap();
        let mut queries: Vec<Query> = (0..3)
            .map(|i| device.create_query(&format!("query {}", i), QueryType::Occlusion))
            .collect();
        let mut active: Option<usize> = None;

        for op in ops {
            match op {
                // One occlusion query may be active at a time.
                QueryOp::Begin(i) if active.is_none() => {
                    if context.begin_query(&mut queries[i]) {
                        active = Some(i);
                    }
                }
                QueryOp::End(i) if active == Some(i) => {
                    prop_assert!(context.end_query(&mut queries[i]));
                    active = None;
                }
                QueryOp::Invalidate(i) if active != Some(i) => queries[i].invalidate(),
                QueryOp::Flush if active.is_none() => {
                    let stale: HashSet<u32> = manager.stale_slots(QueryType::Occlusion).into_iter().collect();
                    context.flush().unwrap();
                    prop_assert!(manager.stale_slots(QueryType::Occlusion).is_empty());
                    let free = manager.free_slots(QueryType::Occlusion);
                    let reset_end: HashSet<u32> = match reuse {
                        StaleQueryReuse::Front => free.iter().take(stale.len()).copied().collect(),
                        StaleQueryReuse::Back => free.iter().rev().take(stale.len()).copied().collect(),
                    };
                    prop_assert_eq!(reset_end, stale);
                }
                _ => {}
            }

            let held: Vec<u32> = queries
                .iter()
                .map(|q| q.slot(0))
                .filter(|&slot| slot != meridian_rhi::query::INVALID_INDEX)
                .collect();
            let mut all: Vec<u32> = held.clone();
            all.extend(manager.stale_slots(QueryType::Occlusion));
            all.extend(manager.free_slots(QueryType::Occlusion));
            all.sort_unstable();
            prop_assert_eq!(all, (0..CAPACITY).collect::<Vec<_>>());
        }

        if let Some(i) = active {
            prop_assert!(context.end_query(&mut queries[i]));
        }
        context.flush().unwrap();
    }
}
