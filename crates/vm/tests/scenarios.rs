//! End-to-end programs through the parser and a locally driven machine.

use std::sync::Arc;

use svi_core::{parser, Affinity, Config, LocationReference, Reference};
use svi_vm::{BufferSink, Pipeline, VmError};

fn run_local(source: &str) -> (svi_vm::VirtualMachine, Arc<BufferSink>) {
    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(source.as_bytes().to_vec());
    let mut vm = pipeline
        .target_local(Config::default(), sink.clone())
        .expect("assemble machine");
    vm.execute().expect("execute program");
    (vm, sink)
}

fn local(name: &str) -> LocationReference {
    LocationReference::new(Affinity::Local, name)
}

#[test]
fn arithmetic_assign_print() {
    let (_vm, sink) = run_local(
        "
        $l:a <- 2
        $l:b <- 3
        $l:c <- plus $l:a $l:b
        out $l:c
        ",
    );
    assert_eq!(sink.out_lines(), vec!["5"]);
}

#[test]
fn conditional_call() {
    let (_vm, sink) = run_local(
        "
        $l:cond <- true
        beginfn f:say $p:VOID
          out \"hi\"
          return
        callif $l:cond f:say
        ",
    );
    assert_eq!(sink.out_lines(), vec!["hi"]);
}

#[test]
fn conditional_call_skips_when_false() {
    let (_vm, sink) = run_local(
        "
        $l:cond <- false
        beginfn f:say $p:VOID
          out \"hi\"
          return
        callif $l:cond f:say
        callelse $l:cond f:say
        ",
    );
    // `callelse` fires on the false branch.
    assert_eq!(sink.out_lines(), vec!["hi"]);
}

#[test]
fn map_round_trip() {
    let (_vm, sink) = run_local(
        "
        $l:m <- mapinit $p:NUMBER
        mapset \"x\" 7 $l:m
        $l:v <- mapget \"x\" $l:m
        out $l:v
        ",
    );
    assert_eq!(sink.out_lines(), vec!["7"]);
}

#[test]
fn enumerate_preserves_collection_order() {
    let (mut vm, _sink) = run_local(
        "
        $l:e <- enuminit $p:NUMBER
        enumappend 10 $l:e
        enumappend 20 $l:e
        enumappend 30 $l:e
        beginfn f:inc $p:NUMBER
          fnparam $p:NUMBER $l:x
          $l:r <- plus $l:x 1
          return $l:r
        $l:out <- enumerate $p:NUMBER $l:e f:inc
        ",
    );

    let out = vm
        .load_from_store(&local("out"))
        .expect("enumerate result stored");
    match out {
        Reference::Enumeration(items) => {
            assert_eq!(items.length(), 3);
            assert_eq!(items.get(0).unwrap(), Reference::Number(11.0));
            assert_eq!(items.get(1).unwrap(), Reference::Number(21.0));
            assert_eq!(items.get(2).unwrap(), Reference::Number(31.0));
        }
        other => panic!("expected enumeration, got {other}"),
    }
}

#[test]
fn svi_sbi_svi_round_trip_is_observably_identical() {
    let source = "
        $l:a <- 4
        $s:total <- times $l:a 10
        beginfn f:shout $p:VOID
          out $s:total
          return
        call f:shout
        out \"done\"
        ";

    let text = Pipeline::from_bytes(source.as_bytes().to_vec());
    let binary = Pipeline::from_bytes(text.binary_representation().unwrap());
    assert!(binary.is_binary());

    let sink_a = Arc::new(BufferSink::new());
    let mut vm_a = text.target_local(Config::default(), sink_a.clone()).unwrap();
    vm_a.execute().unwrap();

    let sink_b = Arc::new(BufferSink::new());
    let mut vm_b = binary
        .target_local(Config::default(), sink_b.clone())
        .unwrap();
    vm_b.execute().unwrap();

    assert_eq!(sink_a.out_lines(), sink_b.out_lines());

    let shared = LocationReference::new(Affinity::Shared, "total");
    assert_eq!(
        vm_a.load_from_store(&shared).unwrap(),
        vm_b.load_from_store(&shared).unwrap()
    );
}

#[test]
fn exception_handler_catches_raise() {
    let (_vm, sink) = run_local(
        "
        beginfn f:h $p:VOID
          fnparam $p:NUMBER $l:code
          out \"caught\"
          return
        pushexhandler f:h
        raise 42
        out \"after\"
        ",
    );
    // The handler runs, then execution continues after the raise.
    assert_eq!(sink.out_lines(), vec!["caught", "after"]);
}

#[test]
fn unhandled_raise_terminates() {
    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(b"raise 42".to_vec());
    let mut vm = pipeline
        .target_local(Config::default(), sink)
        .expect("assemble machine");
    assert!(matches!(
        vm.execute(),
        Err(VmError::UnhandledException { code }) if code == 42.0
    ));
}

#[test]
fn handler_selection_prefers_exact_codes() {
    let (_vm, sink) = run_local(
        "
        beginfn f:any $p:VOID
          fnparam $p:NUMBER $l:code
          out \"any\"
          return
        beginfn f:exact $p:VOID
          fnparam $p:NUMBER $l:code
          out \"exact\"
          return
        $l:codeval <- 42
        pushexhandler f:any
        pushexhandler f:exact $l:codeval
        raise 42
        ",
    );
    assert_eq!(sink.out_lines(), vec!["exact"]);
}

#[test]
fn discriminator_handlers_consult_the_predicate() {
    let (_vm, sink) = run_local(
        "
        beginfn f:h $p:VOID
          fnparam $p:NUMBER $l:code
          out \"picked\"
          return
        beginfn f:is_big $p:BOOLEAN
          fnparam $p:NUMBER $l:code
          $l:big <- gt $l:code 100
          return $l:big
        pushexhandler f:h f:is_big
        raise 200
        ",
    );
    assert_eq!(sink.out_lines(), vec!["picked"]);
}

#[test]
fn popped_handlers_no_longer_match() {
    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(
        "
        beginfn f:h $p:VOID
          fnparam $p:NUMBER $l:code
          out \"caught\"
          return
        $l:id <- pushexhandler f:h
        popexhandler $l:id
        raise 7
        "
        .as_bytes()
        .to_vec(),
    );
    let mut vm = pipeline
        .target_local(Config::default(), sink)
        .expect("assemble machine");
    assert!(matches!(
        vm.execute(),
        Err(VmError::UnhandledException { .. })
    ));
}

#[test]
fn while_loops_until_condition_clears() {
    let (_vm, sink) = run_local(
        "
        beginfn f:body $p:VOID
          $l:i <- plus $l:i 1
          $l:cond <- lt $l:i 3
          return
        $l:i <- 0
        $l:cond <- true
        while $l:cond f:body
        out $l:i
        ",
    );
    assert_eq!(sink.out_lines(), vec!["3"]);
}

#[test]
fn curry_builds_up_applications() {
    let (_vm, sink) = run_local(
        "
        beginfn f:add $p:NUMBER
          fnparam $p:NUMBER $l:x
          fnparam $p:NUMBER $l:y
          $l:r <- plus $l:x $l:y
          return $l:r
        $l:add2 <- curry f:add 2
        $l:v <- call $l:add2 40
        out $l:v
        ",
    );
    assert_eq!(sink.out_lines(), vec!["42"]);
}

#[test]
fn deferred_call_assignment_settles_at_drain() {
    let (_vm, sink) = run_local(
        "
        beginfn f:double $p:NUMBER
          fnparam $p:NUMBER $l:x
          $l:r <- times $l:x 2
          return $l:r
        $l:y <- pushcall f:double 21
        drain
        out $l:y
        ",
    );
    assert_eq!(sink.out_lines(), vec!["42"]);
}

#[test]
fn divide_by_zero_is_fatal() {
    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(b"$l:x <- divide 1 0".to_vec());
    let mut vm = pipeline.target_local(Config::default(), sink).unwrap();
    assert!(matches!(vm.execute(), Err(VmError::DivideByZero)));
}

#[test]
fn streams_push_and_pop_in_order() {
    let (_vm, sink) = run_local(
        "
        $l:s <- streaminit $p:NUMBER
        streampush $l:s 1
        streampush $l:s 2
        $l:empty <- streamempty $l:s
        out $l:empty
        $l:a <- streampop $l:s
        $l:b <- streampop $l:s
        out $l:a
        out $l:b
        ",
    );
    assert_eq!(sink.out_lines(), vec!["false", "1", "2"]);
}

#[test]
fn strings_concat_length_slice() {
    let (_vm, sink) = run_local(
        "
        $l:s <- strconcat \"hello\" \"vm\"
        $l:n <- strlength $l:s
        out $l:n
        $l:tail <- strslice $l:s 5
        out $l:tail
        $l:mid <- strslice $l:s 1 4
        out $l:mid
        ",
    );
    assert_eq!(sink.out_lines(), vec!["7", "vm", "war"]);
}

#[test]
fn object_types_and_instances() {
    let (_vm, sink) = run_local(
        "
        $l:T <- otypeinit
        otypeprop $l:T o:x $p:NUMBER
        otypeprop $l:T o:label $p:STRING
        otypefinalize $l:T
        $l:obj <- objinit $l:T
        objset $l:obj o:x 5
        objset $l:obj o:label \"point\"
        $l:v <- objget $l:obj o:x
        out $l:v
        $l:name <- objget $l:obj o:label
        out $l:name
        ",
    );
    assert_eq!(sink.out_lines(), vec!["5", "point"]);
}

#[test]
fn prologue_functions_are_callable() {
    let (_vm, sink) = run_local(
        "
        $l:f <- call f:FLOOR 2.9
        out $l:f
        $l:r1 <- curry f:RANGE 1
        $l:r2 <- curry $l:r1 3
        $l:range <- call $l:r2 1
        $l:n <- enumlength $l:range
        out $l:n
        $l:first <- enumget $l:range 0
        out $l:first
        ",
    );
    // RANGE walks a half-open span: floor(|3 - 1| / 1) elements from 1.
    assert_eq!(sink.out_lines(), vec!["2", "2", "1"]);
}

#[test]
fn range_supports_descending_steps() {
    let (_vm, sink) = run_local(
        "
        $l:step <- neg 2
        $l:r1 <- curry f:RANGE 5
        $l:r2 <- curry $l:r1 1
        $l:desc <- call $l:r2 $l:step
        $l:n <- enumlength $l:desc
        out $l:n
        $l:a <- enumget $l:desc 0
        out $l:a
        $l:b <- enumget $l:desc 1
        out $l:b
        $l:w1 <- curry f:RANGE 1
        $l:w2 <- curry $l:w1 5
        $l:wrong <- call $l:w2 $l:step
        $l:zn <- enumlength $l:wrong
        out $l:zn
        ",
    );
    // A step pointing away from the end yields an empty range.
    assert_eq!(sink.out_lines(), vec!["2", "5", "3", "0"]);
}

#[test]
fn typify_rejects_mismatched_stores() {
    let sink = Arc::new(BufferSink::new());
    let pipeline = Pipeline::from_bytes(
        "
        typify $l:x $p:NUMBER
        $l:x <- \"not a number\"
        "
        .as_bytes()
        .to_vec(),
    );
    let mut vm = pipeline.target_local(Config::default(), sink).unwrap();
    assert!(vm.execute().is_err());
}

#[test]
fn exit_stops_execution() {
    let (_vm, sink) = run_local(
        "
        out \"before\"
        exit
        out \"after\"
        ",
    );
    assert_eq!(sink.out_lines(), vec!["before"]);
}

#[test]
fn equal_and_compatible() {
    let (_vm, sink) = run_local(
        "
        $l:eq <- equal 3 3
        out $l:eq
        $l:ne <- equal 3 \"three\"
        out $l:ne
        $l:compat <- compatible p:NUMBER p:NUMBER
        out $l:compat
        ",
    );
    assert_eq!(sink.out_lines(), vec!["true", "false", "true"]);
}

#[test]
fn lock_unlock_round_trip() {
    let (_vm, sink) = run_local(
        "
        $s:counter <- 10
        lock $s:counter
        $s:counter <- plus $s:counter 1
        unlock $s:counter
        unlock $s:counter
        out $s:counter
        ",
    );
    // The second unlock is an idempotent no-op.
    assert_eq!(sink.out_lines(), vec!["11"]);
}

#[test]
fn parsed_programs_round_trip_through_sbi_structurally() {
    let source = "
        beginfn f:id $p:NUMBER
          fnparam $p:NUMBER $l:x
          return $l:x
        $l:a <- call f:id 9
        out $l:a
        ";
    let program = parser::parse(source).unwrap();
    let bytes = svi_wire::write_sbi(&program, &mut svi_wire::NullContext).unwrap();
    let produced = svi_wire::read_sbi(&bytes, &mut svi_wire::NullContext).unwrap();
    assert_eq!(produced, program);
}
