#![cfg(unix)]

use std::path::PathBuf;

use pretty_assertions::assert_eq;
use tapedeck_core::events::{EventRecv, Operation};
use tapedeck_core::pipeline::{JobKind, JobStatus, PipelineJobRequest};
use tapedeck_core::project::{ProjectKey, ProjectStore};

use super::support::{Harness, assert_status, next_status, wait_for_job};

fn raw_parts(store: &ProjectStore, key: &ProjectKey, parts: &[&[u8]]) -> Vec<PathBuf> {
    store.ensure_lowres_dir(key).unwrap();
    parts
        .iter()
        .enumerate()
        .map(|(i, bytes)| {
            let path = store.part_path(key, i as u32 + 1);
            std::fs::write(&path, bytes).unwrap();
            path
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn merge_and_export_runs_the_whole_chain() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();
    let key = ProjectKey::new("Urlaub", "2001").unwrap();
    let inputs = raw_parts(orch.store(), &key, &[b"first tape half|", b"second tape half"]);

    let id = orch
        .enqueue(PipelineJobRequest::new(
            JobKind::MergeAndExport,
            inputs,
            "Urlaub",
            "2001",
        ))
        .await
        .unwrap();

    let started = next_status(&mut events, Operation::Merge, "merge_and_export_started").await;
    assert_eq!(started.job_id(), Some(id.to_string().as_str()));
    let finished = next_status(&mut events, Operation::Merge, "merge_and_export_finished").await;
    assert_eq!(finished.payload["result"], "completed");

    let job = wait_for_job(&orch, id).await;
    assert_status(&job, JobStatus::Completed);
    assert_eq!(job.progress, 100);

    let project = orch.store().project(&key).unwrap();
    let merged = project.merged_artifact.clone().unwrap();
    assert_eq!(
        std::fs::read(&merged).unwrap(),
        b"first tape half|second tape half"
    );
    assert!(merged.with_file_name("concat_list.txt").is_file());
    assert!(project.exported);
    let exported = std::fs::read(project.export_path.unwrap()).unwrap();
    assert_eq!(exported, b"first tape half|second tape half");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_input_is_copied_without_running_the_merge_tool() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    let key = ProjectKey::new("Kurz", "1988").unwrap();
    let inputs = raw_parts(orch.store(), &key, &[b"only part"]);

    let id = orch
        .enqueue(PipelineJobRequest::new(
            JobKind::MergeAndExport,
            inputs.clone(),
            "Kurz",
            "1988",
        ))
        .await
        .unwrap();
    assert_status(&wait_for_job(&orch, id).await, JobStatus::Completed);

    let merged = orch.store().merged_path(&key, "avi");
    assert_eq!(std::fs::read(&merged).unwrap(), std::fs::read(&inputs[0]).unwrap());
    let calls = harness.tool_calls();
    assert!(calls.iter().all(|call| !call.contains("concat")), "{calls:?}");
    assert_eq!(calls.len(), 1, "only the upscale should run: {calls:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_upscale_does_not_stop_the_queue() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    let broken = ProjectKey::new("Kaputt", "1995").unwrap();
    let healthy = ProjectKey::new("Heil", "1996").unwrap();
    let broken_inputs = raw_parts(orch.store(), &broken, &[b"a", b"b"]);
    let healthy_inputs = raw_parts(orch.store(), &healthy, &[b"c", b"d"]);

    let first = orch
        .enqueue(PipelineJobRequest::new(
            JobKind::MergeAndExport,
            broken_inputs,
            "Kaputt",
            "1995",
        ))
        .await
        .unwrap();
    let second = orch
        .enqueue(PipelineJobRequest::new(
            JobKind::MergeAndExport,
            healthy_inputs,
            "Heil",
            "1996",
        ))
        .await
        .unwrap();

    let failed = wait_for_job(&orch, first).await;
    assert_status(&failed, JobStatus::Failed);
    let error = failed.error.unwrap();
    assert!(error.contains("upscale"), "{error}");
    assert!(error.contains("upscale exploded"), "{error}");
    assert!(!orch.store().project(&broken).unwrap().exported);

    let completed = wait_for_job(&orch, second).await;
    assert_status(&completed, JobStatus::Completed);
    assert!(orch.store().project(&healthy).unwrap().exported);
    assert!(completed.started_at >= failed.finished_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exporting_an_exported_project_again_leaves_it_untouched() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    let key = ProjectKey::new("Taufe", "1990").unwrap();
    std::fs::create_dir_all(orch.store().highres_dir(&key)).unwrap();
    let artifact = orch.store().upscaled_path(&key);
    std::fs::write(&artifact, b"upscaled video").unwrap();

    let mut request =
        PipelineJobRequest::new(JobKind::ExportOnly, vec![artifact.clone()], "Taufe", "1990");
    request.skip_existing = true;
    let first = orch.enqueue(request.clone()).await.unwrap();
    assert_status(&wait_for_job(&orch, first).await, JobStatus::Completed);

    let destination = orch.store().export_path_for(&key, &artifact);
    let before = std::fs::metadata(&destination).unwrap().modified().unwrap();

    let again = orch.enqueue(request).await.unwrap();
    let job = wait_for_job(&orch, again).await;
    assert_status(&job, JobStatus::Completed);
    assert!(job.message.contains("already exported"), "{}", job.message);
    assert_eq!(std::fs::read(&destination).unwrap(), b"upscaled video");
    assert_eq!(std::fs::metadata(&destination).unwrap().modified().unwrap(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicting_destination_fails_without_overwriting() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    let key = ProjectKey::new("Taufe", "1990").unwrap();
    std::fs::create_dir_all(orch.store().highres_dir(&key)).unwrap();
    let artifact = orch.store().upscaled_path(&key);
    std::fs::write(&artifact, b"new master").unwrap();
    let destination = orch.store().export_path_for(&key, &artifact);
    std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
    std::fs::write(&destination, b"someone else's file").unwrap();

    let id = orch
        .enqueue(PipelineJobRequest::new(
            JobKind::ExportOnly,
            vec![artifact],
            "Taufe",
            "1990",
        ))
        .await
        .unwrap();
    let job = wait_for_job(&orch, id).await;
    assert_status(&job, JobStatus::Failed);
    assert!(job.error.unwrap().contains("already exists"));
    assert_eq!(std::fs::read(&destination).unwrap(), b"someone else's file");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_most_one_job_runs_at_a_time() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();

    let mut ids = Vec::new();
    for (title, year) in [("Eins", "1990"), ("Zwei", "1991"), ("Drei", "1992")] {
        let key = ProjectKey::new(title, year).unwrap();
        let inputs = raw_parts(orch.store(), &key, &[b"x", b"y"]);
        ids.push(
            orch.enqueue(PipelineJobRequest::new(JobKind::MergeAndExport, inputs, title, year))
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        assert_status(&wait_for_job(&orch, *id).await, JobStatus::Completed);
    }

    let mut running = 0i32;
    let mut max_running = 0;
    let mut order = Vec::new();
    while let Some(EventRecv::Event(event)) = events.try_recv() {
        match event.status() {
            Some("merge_and_export_started") => {
                running += 1;
                order.push(event.job_id().map(str::to_string));
            }
            Some("merge_and_export_finished") => running -= 1,
            _ => {}
        }
        max_running = max_running.max(running);
    }
    assert_eq!(max_running, 1);
    assert_eq!(running, 0);
    let expected: Vec<Option<String>> = ids.iter().map(|id| Some(id.to_string())).collect();
    assert_eq!(order, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upscale_progress_is_mapped_into_the_job_range() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();
    let key = ProjectKey::new("Urlaub", "2001").unwrap();
    let inputs = raw_parts(orch.store(), &key, &[b"a", b"b"]);

    let id = orch
        .enqueue(PipelineJobRequest::new(
            JobKind::MergeAndExport,
            inputs,
            "Urlaub",
            "2001",
        ))
        .await
        .unwrap();
    assert_status(&wait_for_job(&orch, id).await, JobStatus::Completed);

    let mut upscale_progress = Vec::new();
    let mut all_progress = Vec::new();
    let mut saw_merge_running = false;
    while let Some(EventRecv::Event(event)) = events.try_recv() {
        if let Some(p) = event.progress() {
            all_progress.push(p);
            if event.operation == Operation::Upscale {
                upscale_progress.push(p);
            }
        }
        if event.operation == Operation::Merge && event.status() == Some("running") {
            saw_merge_running = true;
        }
    }
    assert!(saw_merge_running);
    // 25% and 100% of the upscale stage land at 41 and 90.
    assert!(upscale_progress.contains(&41), "{upscale_progress:?}");
    assert!(upscale_progress.contains(&90), "{upscale_progress:?}");
    assert!(all_progress.windows(2).all(|w| w[0] <= w[1]), "{all_progress:?}");
    assert_eq!(all_progress.last(), Some(&100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cover_is_rendered_from_the_upscaled_video_into_the_library() {
    let harness = Harness::new().with_cover_generator();
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();
    let key = ProjectKey::new("Urlaub", "2001").unwrap();
    std::fs::create_dir_all(orch.store().highres_dir(&key)).unwrap();
    std::fs::write(orch.store().upscaled_path(&key), b"4k video").unwrap();

    let id = orch.generate_cover("Urlaub", "2001").await.unwrap();
    let started = next_status(&mut events, Operation::Cover, "cover_started").await;
    assert_eq!(started.job_id(), Some(id.to_string().as_str()));
    let finished = next_status(&mut events, Operation::Cover, "cover_finished").await;
    assert_eq!(finished.payload["result"], "completed");
    assert_status(&wait_for_job(&orch, id).await, JobStatus::Completed);

    let poster = orch.store().cover_path(&key, "poster.jpg");
    assert_eq!(
        std::fs::read_to_string(&poster).unwrap(),
        "cover Urlaub (2001) from still@60.000:4k video"
    );
    assert!(
        harness
            .tool_calls()
            .iter()
            .any(|call| call.starts_with("-ss 60.000 -i ")),
        "{:?}",
        harness.tool_calls()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_video_falls_back_to_its_opening_frame() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    let key = ProjectKey::new("Short Clip", "1995").unwrap();
    std::fs::create_dir_all(orch.store().highres_dir(&key)).unwrap();
    std::fs::write(orch.store().upscaled_path(&key), b"clip").unwrap();

    let id = orch.generate_cover("Short Clip", "1995").await.unwrap();
    assert_status(&wait_for_job(&orch, id).await, JobStatus::Completed);

    let poster = orch.store().cover_path(&key, "poster.jpg");
    assert_eq!(std::fs::read_to_string(&poster).unwrap(), "still@0.000:clip");
    let grabs = harness
        .tool_calls()
        .into_iter()
        .filter(|call| call.starts_with("-ss "))
        .count();
    assert_eq!(grabs, 2);
}
