//! Swap chain recreation driven by resizes and surface changes.

mod common;

use ash::vk;

use vkframe_renderer::{ChainState, PresentStatus, RecreateReason};

use common::*;

#[test]
fn test_resize_recreates_once_and_flags_one_frame() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    run_frame(&mut renderer).unwrap();

    renderer.resize(800, 600);
    assert_eq!(
        renderer.swap_chain().state(),
        ChainState::RecreatePending(RecreateReason::Resized)
    );

    let status = run_frame(&mut renderer).unwrap();
    assert!(status.updated);
    assert_eq!(
        renderer.swap_chain().extent(),
        vk::Extent2D {
            width: 800,
            height: 600
        }
    );
    assert_eq!(renderer.swap_chain().state(), ChainState::Ready);

    for _ in 0..3 {
        assert!(!run_frame(&mut renderer).unwrap().updated);
    }
    assert_eq!(renderer.swap_chain().recreate_count(), 1);

    let stats = backend.stats();
    assert_eq!(stats.swapchain_creations, 2);
    assert_eq!(stats.live_swapchains, 1);
    assert_eq!(stats.live_image_views, 4);
}

#[test]
fn test_recreation_drains_the_device_first() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    run_frame(&mut renderer).unwrap();
    run_frame(&mut renderer).unwrap();
    assert_eq!(backend.in_flight(), 2);

    renderer.resize(1024, 768);
    run_frame(&mut renderer).unwrap();

    assert_eq!(backend.stats().wait_idle_calls, 1);
    assert_eq!(renderer.frame_clock().completed(), 2);
}

#[test]
fn test_out_of_date_acquire_recovers_in_the_same_call() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    run_frame(&mut renderer).unwrap();

    backend.invalidate_surface();
    let status = run_frame(&mut renderer).unwrap();
    assert!(status.updated);
    assert_eq!(status.frame_number, 2);
    assert_eq!(status.present, PresentStatus::Presented);
    assert_eq!(renderer.swap_chain().recreate_count(), 1);
}

#[test]
fn test_out_of_date_present_recreates_on_next_acquire() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);

    let frame = renderer.begin_frame().unwrap().unwrap();
    backend.invalidate_surface();
    let status = frame.end().unwrap();
    assert_eq!(status.present, PresentStatus::OutOfDate);
    assert_eq!(backend.stats().submitted, 1);
    assert_eq!(backend.stats().presents, 0);
    assert_eq!(
        renderer.swap_chain().state(),
        ChainState::RecreatePending(RecreateReason::OutOfDate)
    );

    let status = run_frame(&mut renderer).unwrap();
    assert!(status.updated);
    assert_eq!(status.present, PresentStatus::Presented);
    assert_eq!(renderer.swap_chain().recreate_count(), 1);
}

#[test]
fn test_suboptimal_acquire_still_renders_then_recreates() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);

    backend.report_suboptimal_once();
    let status = run_frame(&mut renderer).unwrap();
    assert!(!status.updated);
    assert_eq!(backend.stats().presents, 1);
    assert_eq!(
        renderer.swap_chain().state(),
        ChainState::RecreatePending(RecreateReason::Suboptimal)
    );

    let status = run_frame(&mut renderer).unwrap();
    assert!(status.updated);
    assert_eq!(renderer.swap_chain().recreate_count(), 1);
}

#[test]
fn test_zero_extent_skips_frames_until_restored() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    run_frame(&mut renderer).unwrap();

    renderer.resize(0, 0);
    for _ in 0..3 {
        assert!(renderer.begin_frame().unwrap().is_none());
    }
    assert_eq!(backend.stats().submitted, 1);
    assert_eq!(renderer.frame_clock().submitted(), 1);

    renderer.resize(320, 200);
    let status = run_frame(&mut renderer).unwrap();
    assert!(status.updated);
    assert_eq!(status.frame_number, 2);
    assert_eq!(renderer.swap_chain().extent().width, 320);
    assert_eq!(renderer.swap_chain().recreate_count(), 1);
}

#[test]
fn test_image_count_change_resizes_binding_sets() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    let pipeline = pipeline(&mut renderer);
    let (_vertices, geometry) = triangle(&backend);
    let (_, set) = add_object(&mut renderer, pipeline, geometry);
    draw_frame(&mut renderer);

    let dropped = renderer
        .binding_set(set)
        .and_then(|record| record.uniform_buffer(0, 2))
        .unwrap();
    let pool_recreations = renderer.binding_pool().recreation_count();

    backend.set_image_count(2);
    backend.invalidate_surface();
    let status = draw_frame(&mut renderer);
    assert!(status.updated);
    assert_eq!(renderer.swap_chain().image_count(), 2);
    assert_eq!(renderer.binding_pool().image_count(), 2);
    assert_eq!(
        renderer.binding_pool().recreation_count(),
        pool_recreations + 1
    );

    let record = renderer.binding_set(set).unwrap();
    assert!(record.descriptor_set(0).is_some());
    assert!(record.descriptor_set(1).is_some());
    assert!(record.descriptor_set(2).is_none());
    assert!(record.uniform_buffer(0, 2).is_none());

    // The surplus duplicate outlives the frames that might still read it.
    renderer.wait_idle().unwrap();
    run_frame(&mut renderer).unwrap();
    assert!(!backend.is_buffer_alive(dropped));
}

#[test]
fn test_growing_image_count_copies_uniform_contents() {
    let backend = backend(2);
    let mut renderer = renderer(&backend);
    let set = transform_set(&mut renderer);
    {
        let mut frame = renderer.begin_frame().unwrap().unwrap();
        frame.write_uniform_pod(set, 0, &[7.0f32; 16]).unwrap();
        frame.end().unwrap();
    }

    backend.set_image_count(3);
    backend.invalidate_surface();
    assert!(run_frame(&mut renderer).unwrap().updated);

    let bytes = renderer.read_uniform(set, 0, 2, 0, 64).unwrap();
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    assert_eq!(values, vec![7.0; 16]);
}
