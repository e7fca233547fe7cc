//! Binding pool growth, reclamation and per-image uniforms.

mod common;

use approx::assert_relative_eq;
use ash::vk;
use glam::{Mat4, Vec3};

use vkframe_renderer::{BindingPoolConfig, BindingWrite, PoolResource, Renderer, RendererConfig};
use vkframe_rhi::RhiError;
use vkframe_rhi::binding::{BindingKind, BindingLayout, BindingLayoutEntry};
use vkframe_rhi::headless::HeadlessBackend;

use common::*;

fn allocated_sets(renderer: &Renderer<HeadlessBackend>) -> u32 {
    renderer
        .binding_pool()
        .capacity()
        .allocated(PoolResource::Sets)
}

#[test]
fn test_reserve_then_grow_scenario() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    let layout = transform_layout();

    renderer.reserve_binding_space(10, &layout).unwrap();
    assert_eq!(renderer.binding_pool().recreation_count(), 1);
    assert_eq!(allocated_sets(&renderer), 10);

    let sets: Vec<_> = (0..10).map(|_| transform_set(&mut renderer)).collect();
    assert_eq!(renderer.binding_pool().recreation_count(), 1);
    assert_eq!(renderer.binding_pool().live_sets(), 10);

    for &set in &sets[..5] {
        renderer.release_binding_set(set).unwrap();
    }
    let reused = transform_set(&mut renderer);
    assert_eq!(renderer.binding_pool().recreation_count(), 1);
    assert_eq!(renderer.binding_pool().live_sets(), 6);
    assert!(sets[..5].iter().any(|old| old.index() == reused.index()));
    for &set in &sets[..5] {
        assert!(renderer.binding_set(set).is_none());
    }

    for _ in 0..4 {
        transform_set(&mut renderer);
    }
    assert_eq!(renderer.binding_pool().recreation_count(), 1);
    transform_set(&mut renderer);
    assert_eq!(renderer.binding_pool().recreation_count(), 2);
    assert_eq!(allocated_sets(&renderer), 20);
    transform_set(&mut renderer);
    assert_eq!(renderer.binding_pool().recreation_count(), 2);
    assert_eq!(renderer.binding_pool().live_sets(), 12);

    for &set in &sets[5..] {
        let record = renderer.binding_set(set).unwrap();
        for image in 0..3 {
            let descriptor_set = record.descriptor_set(image).unwrap();
            assert!(backend.is_descriptor_set_alive(descriptor_set));
            assert_eq!(backend.descriptor_writes(descriptor_set).len(), 1);
        }
    }
}

#[test]
fn test_growth_is_amortized() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    for _ in 0..100 {
        transform_set(&mut renderer);
    }

    let pool = renderer.binding_pool();
    assert_eq!(pool.recreation_count(), 8);
    assert_eq!(pool.capacity().allocated(PoolResource::Sets), 128);
    assert!(
        pool.capacity()
            .allocated(PoolResource::Descriptors(BindingKind::UniformBuffer))
            >= 100
    );
    assert_eq!(backend.stats().descriptor_pool_creations, 8);
    assert_eq!(backend.stats().live_descriptor_sets, 300);
}

#[test]
fn test_capacity_never_shrinks() {
    let backend = backend(2);
    let mut renderer = renderer(&backend);
    let sets: Vec<_> = (0..9).map(|_| transform_set(&mut renderer)).collect();
    let allocated = allocated_sets(&renderer);
    assert_eq!(allocated, 16);

    for set in sets {
        renderer.release_binding_set(set).unwrap();
    }
    transform_set(&mut renderer);
    assert_eq!(renderer.binding_pool().live_sets(), 1);
    assert_eq!(allocated_sets(&renderer), allocated);

    renderer
        .reserve_binding_space(3, &transform_layout())
        .unwrap();
    assert_eq!(allocated_sets(&renderer), allocated);
}

#[test]
fn test_set_bound_by_in_flight_frame_survives_release() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    let pipeline = pipeline(&mut renderer);
    let (_vertices, geometry) = triangle(&backend);
    let (object, set) = add_object(&mut renderer, pipeline, geometry);

    let status = draw_frame(&mut renderer);
    assert_eq!(
        renderer.binding_set(set).unwrap().last_used(),
        Some(status.frame_number)
    );
    let uniform = renderer.binding_set(set).unwrap().uniform_buffer(0, 0).unwrap();

    renderer.remove_object(object).unwrap();
    assert_eq!(renderer.binding_set(set).unwrap().external_refs(), 0);

    // Frame 1 is still pending, so the sweep leaves the set alone.
    transform_set(&mut renderer);
    let record = renderer.binding_set(set).unwrap();
    let descriptor_set = record.descriptor_set(0).unwrap();
    assert!(backend.is_descriptor_set_alive(descriptor_set));
    assert!(backend.is_buffer_alive(uniform));
    assert_eq!(renderer.binding_pool().live_sets(), 2);

    renderer.wait_idle().unwrap();
    transform_set(&mut renderer);
    assert!(renderer.binding_set(set).is_none());
    assert!(!backend.is_descriptor_set_alive(descriptor_set));
    assert!(!backend.is_buffer_alive(uniform));
}

#[test]
fn test_retained_set_survives_the_sweep() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    let set = transform_set(&mut renderer);
    renderer.retain_binding_set(set).unwrap();
    renderer.release_binding_set(set).unwrap();

    transform_set(&mut renderer);
    assert_eq!(renderer.binding_set(set).unwrap().external_refs(), 1);

    renderer.release_binding_set(set).unwrap();
    assert!(matches!(
        renderer.release_binding_set(set),
        Err(RhiError::InvalidHandle(_))
    ));

    transform_set(&mut renderer);
    assert!(matches!(
        renderer.release_binding_set(set),
        Err(RhiError::InvalidHandle(_))
    ));
    assert!(matches!(
        renderer.read_uniform(set, 0, 0, 0, 4),
        Err(RhiError::InvalidHandle(_))
    ));
}

#[test]
fn test_exhausted_pool_reports_and_recovers() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);

    backend.fail_descriptor_allocations(u32::MAX);
    let result = renderer.get_binding_set(&transform_layout(), vec![BindingWrite::uniform(64)]);
    assert!(matches!(result, Err(RhiError::PoolExhausted { attempts: 8 })));
    assert_eq!(renderer.binding_pool().live_sets(), 0);

    backend.fail_descriptor_allocations(0);
    let set = transform_set(&mut renderer);
    assert!(renderer.binding_set(set).is_some());
    assert_eq!(backend.stats().live_buffers, 3);
}

#[test]
fn test_rebuild_retries_with_bumped_capacity_while_sets_are_live() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    let live = [transform_set(&mut renderer), transform_set(&mut renderer)];
    assert_eq!(allocated_sets(&renderer), 2);
    assert_eq!(renderer.binding_pool().recreation_count(), 2);

    // Each of the next three rebuilds fails on its first live set.
    backend.fail_descriptor_allocations(3);
    let third = transform_set(&mut renderer);

    assert_eq!(renderer.binding_pool().recreation_count(), 3);
    assert_eq!(allocated_sets(&renderer), 32);
    assert_eq!(backend.stats().descriptor_pool_creations, 6);
    for set in live.into_iter().chain([third]) {
        let record = renderer.binding_set(set).unwrap();
        for image in 0..3 {
            let descriptor_set = record.descriptor_set(image).unwrap();
            assert!(backend.is_descriptor_set_alive(descriptor_set));
            assert_eq!(backend.descriptor_writes(descriptor_set).len(), 1);
        }
    }
}

#[test]
fn test_huge_reservation_saturates() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    let layout = BindingLayout::default().with(BindingLayoutEntry::combined_image_sampler(
        vk::ShaderStageFlags::FRAGMENT,
        2,
    ));
    let samplers = PoolResource::Descriptors(BindingKind::CombinedImageSampler);

    let count = u32::MAX / 2 + 1;
    renderer.reserve_binding_space(count, &layout).unwrap();
    let capacity = renderer.binding_pool().capacity();
    assert_eq!(capacity.counter(PoolResource::Sets).reserved, count);
    assert_eq!(capacity.counter(samplers).reserved, u32::MAX);
    assert_eq!(capacity.allocated(samplers), u32::MAX);

    renderer.reserve_binding_space(count, &layout).unwrap();
    let sets = renderer.binding_pool().capacity().counter(PoolResource::Sets);
    assert_eq!(sets.reserved, u32::MAX);
    assert_eq!(sets.allocated, u32::MAX);
}

#[test]
fn test_config_without_recreations_is_rejected() {
    let backend = backend(3);
    let config = RendererConfig {
        binding_pool: BindingPoolConfig {
            max_recreate_attempts: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    let result = Renderer::new(backend.clone(), extent(), config);
    assert!(matches!(result, Err(RhiError::InvalidConfig(_))));
    assert_eq!(backend.stats().live_swapchains, 0);
    assert_eq!(backend.stats().live_fences, 0);
}

#[test]
fn test_failed_free_keeps_the_set_for_the_next_sweep() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    let released = [transform_set(&mut renderer), transform_set(&mut renderer)];
    for &set in &released {
        renderer.release_binding_set(set).unwrap();
    }

    backend.fail_descriptor_frees(1);
    let result = renderer.get_binding_set(&transform_layout(), vec![BindingWrite::uniform(64)]);
    assert!(matches!(result, Err(RhiError::VulkanError(_))));
    // The sweep went on past the failure.
    assert_eq!(renderer.binding_pool().live_sets(), 1);
    assert_eq!(
        renderer
            .binding_pool()
            .capacity()
            .counter(PoolResource::Sets)
            .live,
        1
    );
    assert_eq!(backend.stats().live_descriptor_sets, 3);

    let fresh = transform_set(&mut renderer);
    assert_eq!(renderer.binding_pool().live_sets(), 1);
    assert!(renderer.binding_set(fresh).is_some());
    for &set in &released {
        assert!(renderer.binding_set(set).is_none());
    }
    assert_eq!(backend.stats().live_descriptor_sets, 3);
}

#[test]
fn test_mismatched_writes_are_rejected() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);

    let result = renderer.get_binding_set(&transform_layout(), Vec::new());
    assert!(matches!(result, Err(RhiError::LayoutMismatch(_))));

    let result = renderer.get_binding_set(
        &transform_layout(),
        vec![BindingWrite::uniform(64), BindingWrite::uniform(64)],
    );
    assert!(matches!(result, Err(RhiError::LayoutMismatch(_))));
    assert_eq!(renderer.binding_pool().recreation_count(), 0);
}

#[test]
fn test_uniform_writes_land_in_the_frames_image() {
    let backend = backend(3);
    let mut renderer = renderer(&backend);
    let set = transform_set(&mut renderer);

    let mut images = Vec::new();
    for step in 0..3 {
        let transform = Mat4::from_translation(Vec3::new(step as f32, 0.0, 0.0));
        let mut frame = renderer.begin_frame().unwrap().unwrap();
        frame.write_uniform_pod(set, 0, &transform).unwrap();
        let echoed = frame.read_uniform(set, 0, 0, 64).unwrap();
        assert_eq!(echoed, bytemuck::bytes_of(&transform));
        images.push(frame.image_index());
        frame.end().unwrap();
    }
    assert_eq!(images, vec![0, 1, 2]);

    for (step, &image) in images.iter().enumerate() {
        let bytes = renderer.read_uniform(set, 0, image, 0, 64).unwrap();
        let mut columns = [0.0f32; 16];
        bytemuck::bytes_of_mut(&mut columns).copy_from_slice(&bytes);
        let expected = Mat4::from_translation(Vec3::new(step as f32, 0.0, 0.0));
        for (actual, expected) in columns.iter().zip(expected.to_cols_array()) {
            assert_relative_eq!(*actual, expected);
        }
    }
}
