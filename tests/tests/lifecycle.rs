use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use locallab_core::lifecycle::{BatchItem, LifecycleSettings, ModelLifecycleManager, UnloadOutcome};
use locallab_core::monitor::ResourceMonitor;
use locallab_kernel::error::{InferenceError, RuntimeError};
use locallab_kernel::types::{
    FinishReason, GenerationParams, InstanceState, OptimizationConfig, QuantizationType,
};
use locallab_testing::fixtures::{self, LARGE, MEDIUM, SMALL};
use locallab_testing::{MockRuntime, ScriptedProbe, wait_until};

fn manager(
    runtime: &MockRuntime,
    probe: Arc<ScriptedProbe>,
    settings: LifecycleSettings,
) -> Arc<ModelLifecycleManager> {
    let monitor = Arc::new(ResourceMonitor::new(probe, &fixtures::config()));
    Arc::new(ModelLifecycleManager::new(
        Arc::new(runtime.clone()),
        fixtures::registry(),
        monitor,
        settings,
    ))
}

fn roomy(runtime: &MockRuntime) -> Arc<ModelLifecycleManager> {
    manager(runtime, Arc::new(ScriptedProbe::roomy()), LifecycleSettings::default())
}

fn params() -> GenerationParams {
    GenerationParams::default().with_max_tokens(64)
}

#[tokio::test]
async fn test_ensure_loaded_is_idempotent() {
    let runtime = MockRuntime::new();
    let manager = roomy(&runtime);
    let options = OptimizationConfig::default();

    let first = manager.ensure_loaded(&fixtures::small(), &options).await.unwrap();
    let second = manager.ensure_loaded(&fixtures::small(), &options).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(runtime.load_count(), 1);
    assert_eq!(manager.state_of(SMALL), InstanceState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_loads_share_one_load() {
    let runtime = MockRuntime::new();
    runtime.set_load_delay(Duration::from_millis(200));
    let manager = roomy(&runtime);
    let options = OptimizationConfig::default();
    let descriptor = fixtures::medium();

    let loads = (0..5).map(|_| manager.ensure_loaded(&descriptor, &options));
    let instances: Vec<_> = join_all(loads)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(runtime.load_count(), 1);
    assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
}

#[tokio::test(start_paused = true)]
async fn test_state_is_loading_while_load_runs() {
    let runtime = MockRuntime::new();
    runtime.set_load_delay(Duration::from_millis(500));
    let manager = roomy(&runtime);

    let loader = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .ensure_loaded(&fixtures::small(), &OptimizationConfig::default())
                .await
        })
    };
    wait_until(|| manager.state_of(SMALL) == InstanceState::Loading).await;

    loader.await.unwrap().unwrap();
    assert_eq!(manager.state_of(SMALL), InstanceState::Ready);
}

#[tokio::test]
async fn test_unsupported_optimization_fails_before_loading() {
    let runtime = MockRuntime::new();
    let manager = roomy(&runtime);
    let options = OptimizationConfig::new().with_quantization(QuantizationType::Int4);

    let err = manager
        .ensure_loaded(&fixtures::small(), &options)
        .await
        .unwrap_err();

    assert!(matches!(err, InferenceError::UnsupportedOptimization { .. }));
    assert_eq!(runtime.load_count(), 0);
}

#[tokio::test]
async fn test_auto_selection_prefers_largest_feasible_model() {
    let runtime = MockRuntime::new();
    let probe = Arc::new(ScriptedProbe::new(6000));
    let monitor = Arc::new(ResourceMonitor::new(probe.clone(), &fixtures::config()));
    let manager = ModelLifecycleManager::new(
        Arc::new(runtime.clone()),
        fixtures::registry(),
        Arc::clone(&monitor),
        LifecycleSettings::default(),
    );
    let options = OptimizationConfig::default();

    let selection = manager.select_model(None, &options).unwrap();
    assert_eq!(selection.descriptor.id, MEDIUM);
    assert_eq!(selection.substituted_from, None);

    probe.set_free_ram(3001);
    monitor.refresh();
    assert_eq!(manager.select_model(None, &options).unwrap().descriptor.id, MEDIUM);

    probe.set_free_ram(3000);
    monitor.refresh();
    assert_eq!(manager.select_model(None, &options).unwrap().descriptor.id, SMALL);

    probe.set_free_ram(1000);
    monitor.refresh();
    let err = manager.select_model(None, &options).unwrap_err();
    assert!(matches!(err, InferenceError::ResourceInsufficient { .. }));
}

#[tokio::test]
async fn test_explicit_model_too_large_is_refused_without_fallback() {
    let runtime = MockRuntime::new();
    let manager = manager(
        &runtime,
        Arc::new(ScriptedProbe::new(6000)),
        LifecycleSettings::default(),
    );

    let err = manager
        .select_model(Some(LARGE), &OptimizationConfig::default())
        .unwrap_err();

    assert!(matches!(err, InferenceError::ResourceInsufficient { .. }));
    assert_eq!(runtime.load_count(), 0);
}

#[tokio::test]
async fn test_fallback_prefers_the_descriptor_substitute() {
    let runtime = MockRuntime::new();
    let settings = LifecycleSettings {
        allow_model_fallback: true,
        ..LifecycleSettings::default()
    };
    let manager = manager(&runtime, Arc::new(ScriptedProbe::new(6000)), settings);

    let selection = manager
        .select_model(Some(LARGE), &OptimizationConfig::default())
        .unwrap();

    // medium would fit as well, but large names small as its substitute
    assert_eq!(selection.descriptor.id, SMALL);
    assert_eq!(selection.substituted_from.as_deref(), Some(LARGE));
}

#[tokio::test]
async fn test_fallback_walks_down_by_size() {
    let runtime = MockRuntime::new();
    let settings = LifecycleSettings {
        allow_model_fallback: true,
        ..LifecycleSettings::default()
    };
    let manager = manager(&runtime, Arc::new(ScriptedProbe::new(3000)), settings);

    let selection = manager
        .select_model(Some(MEDIUM), &OptimizationConfig::default())
        .unwrap();
    assert_eq!(selection.descriptor.id, SMALL);

    let err = manager
        .select_model(Some("unknown"), &OptimizationConfig::default())
        .unwrap_err();
    assert!(matches!(err, InferenceError::ModelNotFound(_)));
}

#[tokio::test]
async fn test_vram_requirement_checked_when_gpu_present() {
    let runtime = MockRuntime::new();
    let probe = Arc::new(ScriptedProbe::roomy().with_gpu(8000, 2500));
    let manager = manager(&runtime, probe, LifecycleSettings::default());

    let err = manager
        .ensure_loaded(&fixtures::medium(), &OptimizationConfig::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("VRAM"));

    // small names no VRAM minimum
    manager
        .ensure_loaded(&fixtures::small(), &OptimizationConfig::default())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_load_backs_off_before_retrying() {
    let runtime = MockRuntime::new();
    runtime.fail_loads(SMALL, 2, RuntimeError::internal("weights missing"));
    let settings = LifecycleSettings {
        retry_base: Duration::from_secs(1),
        retry_max: Duration::from_secs(60),
        ..LifecycleSettings::default()
    };
    let manager = manager(&runtime, Arc::new(ScriptedProbe::roomy()), settings);
    let small = fixtures::small();
    let options = OptimizationConfig::default();

    let err = manager.ensure_loaded(&small, &options).await.unwrap_err();
    assert!(matches!(err, InferenceError::LoadFailure { .. }));
    assert_eq!(manager.state_of(SMALL), InstanceState::Failed);

    // within the backoff window the runtime is not called again
    let again = manager.ensure_loaded(&small, &options).await.unwrap_err();
    assert_eq!(again, err);
    assert_eq!(runtime.load_count(), 1);

    tokio::time::advance(Duration::from_millis(1001)).await;
    manager.ensure_loaded(&small, &options).await.unwrap_err();
    assert_eq!(runtime.load_count(), 2);

    // second failure doubles the delay
    tokio::time::advance(Duration::from_millis(1001)).await;
    manager.ensure_loaded(&small, &options).await.unwrap_err();
    assert_eq!(runtime.load_count(), 2);

    tokio::time::advance(Duration::from_millis(1001)).await;
    manager.ensure_loaded(&small, &options).await.unwrap();
    assert_eq!(runtime.load_count(), 3);
    assert_eq!(manager.state_of(SMALL), InstanceState::Ready);
}

#[tokio::test]
async fn test_execute_returns_results_in_batch_order() {
    let runtime = MockRuntime::new();
    runtime.add_response("capital", "Paris");
    runtime.add_response("color", "The sky is blue");
    runtime.set_parallelism(2);
    let manager = roomy(&runtime);
    let instance = manager
        .ensure_loaded(&fixtures::small(), &OptimizationConfig::default())
        .await
        .unwrap();

    let batch = vec![
        BatchItem::new("What is the capital of France?", params()),
        BatchItem::new("What color is the sky?", params()),
        BatchItem::new("Say something", params()),
    ];
    let results = manager.execute(&instance, &batch).await.unwrap();

    let texts: Vec<String> = results.into_iter().map(|r| r.unwrap().text).collect();
    assert_eq!(texts, ["Paris", "The sky is blue", "This is a mock response."]);
    assert_eq!(instance.in_flight(), 0);
}

#[tokio::test]
async fn test_recoverable_failure_fails_batch_but_keeps_instance() {
    let runtime = MockRuntime::new();
    runtime.fail_next_stream_after(1, RuntimeError::internal("sampler panicked"));
    let manager = roomy(&runtime);
    let instance = manager
        .ensure_loaded(&fixtures::small(), &OptimizationConfig::default())
        .await
        .unwrap();

    let batch = vec![BatchItem::new("a", params()), BatchItem::new("b", params())];
    let results = manager.execute(&instance, &batch).await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(
        results
            .iter()
            .all(|r| matches!(r, Err(InferenceError::GenerationFailure(_))))
    );
    assert_eq!(instance.state(), InstanceState::Ready);
    assert_eq!(instance.in_flight(), 0);
}

#[tokio::test]
async fn test_out_of_memory_fails_instance_and_next_load_replaces_it() {
    let runtime = MockRuntime::new();
    runtime.fail_next_generate(RuntimeError::out_of_memory("CUDA out of memory"));
    let manager = roomy(&runtime);
    let options = OptimizationConfig::default();
    let instance = manager.ensure_loaded(&fixtures::small(), &options).await.unwrap();

    let results = manager
        .execute(&instance, &[BatchItem::new("hi", params())])
        .await
        .unwrap();
    assert!(matches!(results[0], Err(InferenceError::GenerationFailure(_))));
    assert_eq!(instance.state(), InstanceState::Failed);
    assert_eq!(instance.in_flight(), 0);

    // a failed instance accepts no work
    assert!(manager.execute(&instance, &[BatchItem::new("hi", params())]).await.is_err());

    let replacement = manager.ensure_loaded(&fixtures::small(), &options).await.unwrap();
    assert!(!Arc::ptr_eq(&instance, &replacement));
    assert_eq!(runtime.load_count(), 2);
    assert_eq!(runtime.unload_count(), 1);
}

#[tokio::test]
async fn test_unload_waits_for_in_flight_requests() {
    let runtime = MockRuntime::new();
    runtime.pause();
    let manager = roomy(&runtime);
    let instance = manager
        .ensure_loaded(&fixtures::small(), &OptimizationConfig::default())
        .await
        .unwrap();

    let running = {
        let manager = Arc::clone(&manager);
        let instance = Arc::clone(&instance);
        tokio::spawn(async move {
            manager
                .execute(&instance, &[BatchItem::new("hold", params())])
                .await
        })
    };
    wait_until(|| instance.in_flight() == 1).await;

    assert_eq!(manager.unload(SMALL).await, UnloadOutcome::Draining);
    assert_eq!(instance.state(), InstanceState::Unloading);
    assert_eq!(runtime.unload_count(), 0);

    runtime.resume();
    let results = running.await.unwrap().unwrap();
    assert!(results[0].is_ok());

    wait_until(|| runtime.unload_count() == 1).await;
    assert_eq!(instance.state(), InstanceState::Unloaded);
    assert_eq!(manager.unload(SMALL).await, UnloadOutcome::NotLoaded);
}

#[tokio::test]
async fn test_unload_idle_instance_is_immediate() {
    let runtime = MockRuntime::new();
    let manager = roomy(&runtime);
    manager
        .ensure_loaded(&fixtures::small(), &OptimizationConfig::default())
        .await
        .unwrap();

    assert_eq!(manager.unload(SMALL).await, UnloadOutcome::Unloaded);
    assert_eq!(runtime.unload_count(), 1);
    assert!(runtime.resident_models().is_empty());
    assert_eq!(manager.state_of(SMALL), InstanceState::Unloaded);
}

#[tokio::test]
async fn test_single_model_mode_swaps_models() {
    let runtime = MockRuntime::new();
    let manager = roomy(&runtime);
    let options = OptimizationConfig::default();

    manager.ensure_loaded(&fixtures::small(), &options).await.unwrap();
    manager.ensure_loaded(&fixtures::medium(), &options).await.unwrap();

    assert_eq!(runtime.resident_models(), [MEDIUM]);
    assert_eq!(manager.instances().len(), 1);
    assert_eq!(manager.state_of(SMALL), InstanceState::Unloaded);
}

#[tokio::test]
async fn test_changed_options_replace_the_instance() {
    let runtime = MockRuntime::new();
    let manager = roomy(&runtime);

    manager
        .ensure_loaded(&fixtures::small(), &OptimizationConfig::default())
        .await
        .unwrap();
    let int8 = OptimizationConfig::new().with_quantization(QuantizationType::Int8);
    let instance = manager.ensure_loaded(&fixtures::small(), &int8).await.unwrap();

    assert_eq!(*instance.options(), int8);
    assert_eq!(runtime.load_count(), 2);
    assert_eq!(runtime.unload_count(), 1);
    assert_eq!(runtime.load_log()[1], (SMALL.to_string(), int8));
}

#[tokio::test(start_paused = true)]
async fn test_multi_model_mode_evicts_least_recently_used() {
    let runtime = MockRuntime::new();
    let settings = LifecycleSettings {
        max_loaded_models: 2,
        ..LifecycleSettings::default()
    };
    let manager = manager(&runtime, Arc::new(ScriptedProbe::roomy()), settings);
    let options = OptimizationConfig::default();

    manager.ensure_loaded(&fixtures::small(), &options).await.unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;
    manager.ensure_loaded(&fixtures::medium(), &options).await.unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;
    // touch small so medium becomes the least recently used
    manager.ensure_loaded(&fixtures::small(), &options).await.unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;

    manager.ensure_loaded(&fixtures::large(), &options).await.unwrap();

    let mut resident = runtime.resident_models();
    resident.sort();
    assert_eq!(resident, [LARGE, SMALL]);
    assert_eq!(manager.state_of(MEDIUM), InstanceState::Unloaded);
}

#[tokio::test(start_paused = true)]
async fn test_idle_models_are_unloaded() {
    let runtime = MockRuntime::new();
    let settings = LifecycleSettings {
        idle_timeout: Some(Duration::from_secs(30)),
        ..LifecycleSettings::default()
    };
    let manager = manager(&runtime, Arc::new(ScriptedProbe::roomy()), settings);
    manager
        .ensure_loaded(&fixtures::small(), &OptimizationConfig::default())
        .await
        .unwrap();

    assert!(manager.evict_idle().await.is_empty());

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(manager.evict_idle().await, [SMALL]);
    assert_eq!(runtime.unload_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_reaper_runs_periodically() {
    let runtime = MockRuntime::new();
    let settings = LifecycleSettings {
        idle_timeout: Some(Duration::from_secs(30)),
        idle_check_interval: Duration::from_secs(10),
        ..LifecycleSettings::default()
    };
    let manager = manager(&runtime, Arc::new(ScriptedProbe::roomy()), settings);
    manager
        .ensure_loaded(&fixtures::small(), &OptimizationConfig::default())
        .await
        .unwrap();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let reaper = manager.spawn_idle_reaper(shutdown.clone()).unwrap();

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(runtime.unload_count(), 1);

    shutdown.cancel();
    reaper.await.unwrap();
}

#[tokio::test]
async fn test_zero_max_tokens_completes_without_generating() {
    let runtime = MockRuntime::new();
    let manager = roomy(&runtime);
    let instance = manager
        .ensure_loaded(&fixtures::small(), &OptimizationConfig::default())
        .await
        .unwrap();

    let item = BatchItem::new("hi", GenerationParams::default().with_max_tokens(0));
    let results = manager.execute(&instance, &[item]).await.unwrap();
    let completion = results.into_iter().next().unwrap().unwrap();

    assert_eq!(completion.text, "");
    assert_eq!(completion.finish_reason, FinishReason::Length);
    assert_eq!(runtime.generate_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_swap_still_releases_previous_model() {
    let runtime = MockRuntime::new();
    let manager = roomy(&runtime);
    let options = OptimizationConfig::default();
    let small = manager.ensure_loaded(&fixtures::small(), &options).await.unwrap();

    runtime.set_load_delay(Duration::from_secs(1));
    let attempt = tokio::time::timeout(
        Duration::from_millis(10),
        manager.ensure_loaded(&fixtures::medium(), &options),
    )
    .await;
    assert!(attempt.is_err());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(small.state(), InstanceState::Unloaded);
    assert_eq!(runtime.resident_models(), [MEDIUM]);
    assert_eq!(manager.state_of(MEDIUM), InstanceState::Ready);
    assert_eq!(runtime.unload_count(), 1);
    assert_eq!(manager.instances().len(), 1);
}

#[tokio::test]
async fn test_auto_selection_with_nothing_feasible_ignores_fallback() {
    let runtime = MockRuntime::new();
    let settings = LifecycleSettings {
        allow_model_fallback: true,
        ..LifecycleSettings::default()
    };
    let manager = manager(&runtime, Arc::new(ScriptedProbe::new(500)), settings);

    let err = manager
        .select_model(None, &OptimizationConfig::default())
        .unwrap_err();

    assert!(matches!(err, InferenceError::ResourceInsufficient { ref model_id, .. } if model_id == "auto"));
    assert_eq!(runtime.load_count(), 0);
}
