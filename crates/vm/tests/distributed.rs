//! Deferred calls across worker threads and the KV-backed drivers.

use std::sync::Arc;

use svi_core::{Affinity, Config, LocationReference, Reference};
use svi_vm::runtime::kv::{KvClient, MemoryKv};
use svi_vm::{BufferSink, JobState, Pipeline};

fn quick_config() -> Config {
    Config {
        workers: 2,
        lock_sleep_ms: 1,
        drain_sleep_ms: 1,
        worker_sleep_ms: 1,
        ..Config::default()
    }
}

#[test]
fn enumerate_runs_on_worker_threads() {
    let source = "
        $l:e <- enuminit $p:NUMBER
        enumappend 10 $l:e
        enumappend 20 $l:e
        enumappend 30 $l:e
        beginfn f:inc $p:NUMBER
          fnparam $p:NUMBER $l:x
          $l:r <- plus $l:x 1
          return $l:r
        $l:out <- enumerate $p:NUMBER $l:e f:inc
        ";

    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(source.as_bytes().to_vec());
    let (mut vm, handles, shutdown) = pipeline
        .target_threaded(quick_config(), sink)
        .expect("assemble machine");

    vm.execute().expect("execute program");
    shutdown.trigger();
    for handle in handles {
        handle.join().expect("worker joins");
    }

    let out = vm
        .load_from_store(&LocationReference::new(Affinity::Local, "out"))
        .expect("result stored");
    match out {
        Reference::Enumeration(items) => {
            // Bodies may run in any order on any worker; the collected
            // order follows the collection.
            assert_eq!(items.get(0).unwrap(), Reference::Number(11.0));
            assert_eq!(items.get(1).unwrap(), Reference::Number(21.0));
            assert_eq!(items.get(2).unwrap(), Reference::Number(31.0));
        }
        other => panic!("expected enumeration, got {other}"),
    }
}

#[test]
fn drain_barrier_settles_every_prior_job() {
    let source = "
        beginfn f:double $p:NUMBER
          fnparam $p:NUMBER $l:x
          $l:r <- times $l:x 2
          return $l:r
        $l:a <- pushcall f:double 1
        $l:b <- pushcall f:double 2
        $l:c <- pushcall f:double 3
        drain
        out $l:a
        out $l:b
        out $l:c
        ";

    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(source.as_bytes().to_vec());
    let (mut vm, handles, shutdown) = pipeline
        .target_threaded(quick_config(), sink.clone())
        .expect("assemble machine");

    vm.execute().expect("execute program");
    shutdown.trigger();
    for handle in handles {
        handle.join().expect("worker joins");
    }

    assert_eq!(sink.out_lines(), vec!["2", "4", "6"]);
}

#[test]
fn shared_store_is_visible_to_deferred_calls() {
    let source = "
        $s:base <- 40
        beginfn f:bump $p:NUMBER
          $l:r <- plus $s:base 2
          return $l:r
        $l:v <- pushcall f:bump
        drain
        out $l:v
        ";

    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(source.as_bytes().to_vec());
    let (mut vm, handles, shutdown) = pipeline
        .target_threaded(quick_config(), sink.clone())
        .expect("assemble machine");

    vm.execute().expect("execute program");
    shutdown.trigger();
    for handle in handles {
        handle.join().expect("worker joins");
    }

    assert_eq!(sink.out_lines(), vec!["42"]);
}

#[test]
fn local_bindings_travel_with_the_job() {
    let source = "
        $l:offset <- 5
        beginfn f:add_offset $p:NUMBER
          fnparam $p:NUMBER $l:x
          $l:r <- plus $l:x $l:offset
          return $l:r
        $l:v <- pushcall f:add_offset 10
        drain
        out $l:v
        ";

    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(source.as_bytes().to_vec());
    let (mut vm, handles, shutdown) = pipeline
        .target_threaded(quick_config(), sink.clone())
        .expect("assemble machine");

    vm.execute().expect("execute program");
    shutdown.trigger();
    for handle in handles {
        handle.join().expect("worker joins");
    }

    assert_eq!(sink.out_lines(), vec!["15"]);
}

#[test]
fn kv_target_runs_programs_end_to_end() {
    let source = "
        $s:greeting <- \"hello\"
        beginfn f:fetch $p:STRING
          return $s:greeting
        $l:v <- pushcall f:fetch
        drain
        out $l:v
        ";

    let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(source.as_bytes().to_vec());
    let (mut vm, handles, shutdown) = pipeline
        .target_kv(quick_config(), kv, sink.clone())
        .expect("assemble machine");

    vm.execute().expect("execute program");
    shutdown.trigger();
    for handle in handles {
        handle.join().expect("worker joins");
    }

    assert_eq!(sink.out_lines(), vec!["hello"]);
}

#[test]
fn jobs_reach_terminal_states() {
    let source = "
        beginfn f:noop $p:VOID
          return
        pushcall f:noop
        drain
        ";

    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(source.as_bytes().to_vec());
    let (mut vm, handles, shutdown) = pipeline
        .target_threaded(quick_config(), sink)
        .expect("assemble machine");

    vm.execute().expect("execute program");

    // The first job allocated gets id 0; after the drain barrier it must
    // be settled.
    assert!(vm.queue().job_state(0).is_terminal());
    assert_eq!(vm.queue().job_state(999), JobState::Unknown);

    shutdown.trigger();
    for handle in handles {
        handle.join().expect("worker joins");
    }
}

#[test]
fn tag_resources_steer_scheduling_filters() {
    let source = "
        beginfn f:noop $p:VOID
          return
        $l:t1 <- curry f:TAG \"zone\"
        $l:tag <- call $l:t1 \"a\"
        with $l:tag f:noop
        ";

    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(source.as_bytes().to_vec());
    let mut vm = pipeline
        .target_local(Config::default(), sink)
        .expect("assemble machine");
    vm.execute().expect("execute program");

    // Filters applied while the tag was held were removed on release.
    assert!(vm.global().scheduling_filters().is_empty());
}
