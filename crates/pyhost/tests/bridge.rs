//! End-to-end tests against a real interpreter.

#[macro_use]
mod common;

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use num_bigint::BigInt;
use pretty_assertions::assert_eq;
use pyhost::{
    CodeHash, CollectOutput, Decoded, Error, Globals, InitConfig, Outputs, Python, UsageError, Value,
};

use crate::common::{eval_value, globals};

fn python_error(result: Result<impl std::fmt::Debug, Error>) -> Box<pyhost::PyException> {
    match result {
        Err(Error::Python(exc)) => exc,
        other => panic!("expected a Python exception, got {other:?}"),
    }
}

fn sorted(mut items: Vec<Value>) -> Vec<Value> {
    items.sort_by_key(Value::py_repr);
    items
}

#[test]
fn values_round_trip_through_the_interpreter() {
    let python = python_or_skip!();
    let value = Value::Dict(vec![
        (Value::from("none"), Value::None),
        (Value::from("flags"), Value::List(vec![Value::Bool(true), Value::Bool(false)])),
        (Value::from("small"), Value::Int(-42)),
        (Value::from("big"), Value::BigInt(BigInt::from(1u128 << 100))),
        (Value::from("negative big"), Value::BigInt(-BigInt::from(u64::MAX) * 3)),
        (Value::from("float"), Value::Float(2.5)),
        (Value::from("text"), Value::from("héllo\nworld")),
        (Value::from("bytes"), Value::Bytes(vec![0, 1, 254, 255])),
        (Value::Int(7), Value::Tuple(vec![Value::Int(1), Value::Tuple(vec![])])),
    ]);
    let object = python.encode(&value).unwrap();
    assert_eq!(python.decode(&object).unwrap(), value);
}

#[test]
fn scalars_and_small_containers_match_their_literals() {
    let python = python_or_skip!();
    let cases = [
        ("0", Value::Int(0)),
        ("-1", Value::Int(-1)),
        ("2 ** 70", Value::BigInt(BigInt::from(1u128 << 70))),
        ("10.5", Value::Float(10.5)),
        ("''", Value::from("")),
        ("'🦊'", Value::from("🦊")),
        (r"b'\x00\xff'", Value::Bytes(vec![0, 255])),
        ("()", Value::Tuple(vec![])),
        ("[1, 2]", Value::List(vec![Value::Int(1), Value::Int(2)])),
        ("{'a': 1}", Value::Dict(vec![(Value::from("a"), Value::Int(1))])),
    ];
    for (literal, expected) in cases {
        assert_eq!(eval_value(python, literal), expected, "decoding {literal}");
        let encoded = python.encode(&expected).unwrap();
        let evaluated = python.eval(literal, &Globals::new(), &Outputs::discard()).unwrap();
        assert_eq!(
            python.repr(&encoded).unwrap(),
            python.repr(evaluated.result.as_ref().unwrap()).unwrap()
        );
    }
}

#[test]
fn sets_decode_in_any_order() {
    let python = python_or_skip!();
    let decoded = eval_value(python, "{3, 1, 2}");
    let Value::Set(items) = decoded else {
        panic!("expected a set, got {decoded:?}");
    };
    assert_eq!(sorted(items), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);

    let decoded = eval_value(python, "frozenset(['a'])");
    assert_eq!(decoded, Value::Set(vec![Value::from("a")]));

    let encoded = python.encode(&Value::Set(vec![Value::Int(2), Value::Int(1)])).unwrap();
    assert_eq!(encoded.type_name(python).unwrap(), "set");
    let Value::Set(items) = python.decode(&encoded).unwrap() else {
        panic!("expected a set");
    };
    assert_eq!(sorted(items), vec![Value::Int(1), Value::Int(2)]);
}

#[test]
fn host_float_repr_agrees_with_the_interpreter() {
    let python = python_or_skip!();
    for value in [1e20, 1e16, 1e15, 0.1, 0.00001, -2.5e-7, 1.0 / 3.0, f64::MAX, f64::INFINITY] {
        let object = python.float(value).unwrap();
        assert_eq!(Value::Float(value).py_repr(), python.repr(&object).unwrap(), "repr of {value:e}");
    }
}

#[test]
fn decode_once_yields_handles_for_container_items() {
    let python = python_or_skip!();
    let list = python.eval("[object(), 1]", &Globals::new(), &Outputs::discard()).unwrap().result.unwrap();
    let Decoded::List(items) = python.decode_once(&list).unwrap() else {
        panic!("expected a list");
    };
    assert_eq!(items.len(), 2);
    assert_eq!(python.decode_once(&items[0]).unwrap().kind(), "opaque");
    assert_eq!(items[0].type_name(python).unwrap(), "object");
    assert!(matches!(python.decode_once(&items[1]).unwrap(), Decoded::Int(1)));
}

#[test]
fn constructors_build_the_expected_types() {
    let python = python_or_skip!();
    let one = python.int(1).unwrap();
    let name = python.string("one").unwrap();
    let dict = python.dict(&[(name.clone(), one.clone())]).unwrap();
    assert_eq!(python.repr(&dict).unwrap(), "{'one': 1}");
    let tuple = python.tuple(&[one.clone(), python.none().unwrap()]).unwrap();
    assert_eq!(python.repr(&tuple).unwrap(), "(1, None)");
    let list = python.list(&[python.bool(true).unwrap(), python.bytes(b"x").unwrap()]).unwrap();
    assert_eq!(python.repr(&list).unwrap(), "[True, b'x']");
    let set = python.set(&[one.clone(), one]).unwrap();
    assert_eq!(python.repr(&set).unwrap(), "{1}");
    assert_eq!(name.str(python).unwrap(), "one");
    assert_eq!(python.float(0.5).unwrap().repr(python).unwrap(), "0.5");
}

#[test]
fn trailing_expression_is_the_result() {
    let python = python_or_skip!();
    let output = python
        .eval("x = 6\ny = x * 7\ny", &Globals::new(), &Outputs::discard())
        .unwrap();
    assert_eq!(python.decode(output.result.as_ref().unwrap()).unwrap(), Value::Int(42));
    assert_eq!(output.globals.keys().collect::<Vec<_>>(), ["x", "y"]);

    assert_eq!(eval_value(python, "1\n2"), Value::Int(2));
    assert_eq!(eval_value(python, "print\n"), eval_value(python, "print"));
}

#[test]
fn snippets_without_a_trailing_expression_have_no_result() {
    let python = python_or_skip!();
    for source in ["x = 1", "", "# comment", "if True:\n    3", "def f():\n    return 1\n"] {
        let output = python.eval(source, &Globals::new(), &Outputs::discard()).unwrap();
        assert!(output.result.is_none(), "{source:?} produced a result");
    }
}

#[test]
fn evaluations_do_not_share_namespaces() {
    let python = python_or_skip!();
    python.eval("leaked = 5", &Globals::new(), &Outputs::discard()).unwrap();
    let exc = python_error(python.eval("leaked", &Globals::new(), &Outputs::discard()));
    assert_eq!(exc.type_name(), "NameError");
    assert!(exc.message().contains("'leaked'"), "unexpected message: {}", exc.message());
    assert!(exc.lines().last().unwrap().starts_with("NameError"));

    let first = python.eval("x = 1", &Globals::new(), &Outputs::discard()).unwrap();
    let second = python.eval("y = 1", &Globals::new(), &Outputs::discard()).unwrap();
    assert_eq!(first.globals.keys().collect::<Vec<_>>(), ["x"]);
    assert_eq!(second.globals.keys().collect::<Vec<_>>(), ["y"]);
}

#[test]
fn supplied_globals_are_visible_and_only_rebound_names_come_back() {
    let python = python_or_skip!();
    let a = python.int(10).unwrap();
    let b = python.int(20).unwrap();
    let output = python
        .eval("b = b + 1\nc = a + b\nc", &globals([("a", &a), ("b", &b)]), &Outputs::discard())
        .unwrap();
    assert_eq!(python.decode(output.result.as_ref().unwrap()).unwrap(), Value::Int(31));
    assert_eq!(output.globals.keys().collect::<Vec<_>>(), ["b", "c"]);
    assert_eq!(python.decode(&output.globals["b"]).unwrap(), Value::Int(21));
}

#[test]
fn rebinding_is_reported_by_object_identity() {
    let python = python_or_skip!();
    let x = python.int(5).unwrap();
    let items = python.encode(&Value::List(vec![Value::Int(1), Value::Int(2)])).unwrap();
    let supplied = globals([("x", &x), ("items", &items)]);
    let bound = |source: &str| {
        let output = python.eval(source, &supplied, &Outputs::discard()).unwrap();
        output.globals.keys().cloned().collect::<Vec<_>>()
    };

    // an equal but distinct object counts as a new binding
    assert_eq!(bound("items = list(items)"), ["items"]);
    assert_eq!(bound("x = 6"), ["x"]);
    // the very same object does not: small ints are shared, so `x = 5` looks untouched
    assert_eq!(bound("x = x"), Vec::<String>::new());
    assert_eq!(bound("x = 5"), Vec::<String>::new());
    assert_eq!(bound("items.append(3)"), Vec::<String>::new());
}

#[test]
fn handles_keep_functions_usable_across_evaluations() {
    let python = python_or_skip!();
    let defined = python
        .eval("def double(n):\n    return n * 2\n", &Globals::new(), &Outputs::discard())
        .unwrap();
    let double = &defined.globals["double"];
    let result = python
        .eval("double(21)", &globals([("double", double)]), &Outputs::discard())
        .unwrap();
    assert_eq!(python.decode(result.result.as_ref().unwrap()).unwrap(), Value::Int(42));
}

#[test]
fn syntax_errors_are_python_exceptions() {
    let python = python_or_skip!();
    let exc = python_error(python.eval("def broken(:\n", &Globals::new(), &Outputs::discard()));
    assert_eq!(exc.type_name(), "SyntaxError");
}

#[test]
fn exceptions_carry_a_renderable_traceback() {
    let python = python_or_skip!();
    let exc = python_error(python.eval("def f():\n    return 1 / 0\nf()", &Globals::new(), &Outputs::discard()));
    assert_eq!(exc.type_name(), "ZeroDivisionError");
    assert_eq!(exc.message(), "ZeroDivisionError: division by zero");
    assert!(exc.to_string().contains("Traceback (most recent call last)"));

    let lines = python
        .format_exception(exc.ptype(), exc.pvalue(), exc.ptraceback())
        .unwrap();
    assert_eq!(lines, exc.lines());
}

#[test]
fn output_goes_to_the_evaluation_sinks() {
    let python = python_or_skip!();
    let stdout = Arc::new(CollectOutput::new());
    let stderr = Arc::new(CollectOutput::new());
    let outputs = Outputs::new(stdout.clone(), stderr.clone());
    python
        .eval("import sys\nprint('hello', 'world')\nprint('oops', file=sys.stderr)", &Globals::new(), &outputs)
        .unwrap();
    assert_eq!(stdout.output(), "hello world\n");
    assert_eq!(stderr.output(), "oops\n");
}

#[test]
fn output_from_threads_follows_the_evaluation_that_started_them() {
    let python = python_or_skip!();
    let first = Arc::new(CollectOutput::new());
    let started = python
        .eval(
            "import threading, time\n\
             def late():\n    time.sleep(0.1)\n    print('late')\n\
             worker = threading.Thread(target=late)\n\
             worker.start()\n",
            &Globals::new(),
            &Outputs::merged(first.clone()),
        )
        .unwrap();
    assert_eq!(first.output(), "");

    let second = Arc::new(CollectOutput::new());
    python
        .eval(
            "worker.join()\nprint('joined')",
            &globals([("worker", &started.globals["worker"])]),
            &Outputs::merged(second.clone()),
        )
        .unwrap();
    assert_eq!(first.output(), "late\n");
    assert_eq!(second.output(), "joined\n");
}

#[test]
fn stdin_reads_raise() {
    let python = python_or_skip!();
    let exc = python_error(python.eval("import sys\nsys.stdin.read()", &Globals::new(), &Outputs::discard()));
    assert_eq!(exc.type_name(), "RuntimeError");
    assert!(exc.message().contains("stdin not supported"));
}

#[test]
fn interpreter_code_can_send_to_mailboxes() {
    let python = python_or_skip!();
    let mailbox = python.new_mailbox();
    let handle = python.encode(&Value::Mailbox(mailbox.id())).unwrap();
    assert_eq!(python.decode(&handle).unwrap(), Value::Mailbox(mailbox.id()));

    python
        .eval(
            "import pyhost\npyhost.send_tagged_object(box, 'greeting', {'a': 1})",
            &globals([("box", &handle)]),
            &Outputs::discard(),
        )
        .unwrap();
    let message = mailbox.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(message.tag, "greeting");
    assert_eq!(
        python.decode(&message.object).unwrap(),
        Value::Dict(vec![(Value::from("a"), Value::Int(1))])
    );
    assert!(mailbox.try_recv().is_none());

    drop(mailbox);
    let exc = python_error(python.eval(
        "import pyhost\npyhost.send_tagged_object(box, 'late', None)",
        &globals([("box", &handle)]),
        &Outputs::discard(),
    ));
    assert_eq!(exc.type_name(), "RuntimeError");
}

#[test]
fn second_init_is_rejected() {
    let _python = python_or_skip!();
    let err = Python::init(InitConfig::new("/nonexistent/libpython.so", "/nonexistent", "/nonexistent/python")).unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::AlreadyInitialized)), "unexpected error: {err}");
}

#[test]
fn compiled_code_is_cached_by_hash() {
    let python = python_or_skip!();
    let hash = CodeHash::of("cache_probe_marker = 'first'\n'first'");
    let first = python
        .eval_with_hash("'first'", hash, &Globals::new(), &Outputs::discard())
        .unwrap();
    assert_eq!(python.decode(first.result.as_ref().unwrap()).unwrap(), Value::from("first"));
    // same key, different text: the cached code runs
    let second = python
        .eval_with_hash("'second'", hash, &Globals::new(), &Outputs::discard())
        .unwrap();
    assert_eq!(python.decode(second.result.as_ref().unwrap()).unwrap(), Value::from("first"));
    assert!(python.cached_code_count() >= 1);
}

#[test]
fn concurrent_evaluations_from_many_threads() {
    let python = python_or_skip!();
    let workers: Vec<_> = (0..8_i64)
        .map(|n| {
            let python = python.clone();
            thread::spawn(move || {
                let input = python.int(n).unwrap();
                let sink = Arc::new(CollectOutput::new());
                let mut results = Vec::new();
                for _ in 0..20 {
                    let output = python
                        .eval(
                            "print(n)\nsum(range(n + 1))",
                            &[("n".to_owned(), input.clone())].into_iter().collect(),
                            &Outputs::merged(sink.clone()),
                        )
                        .unwrap();
                    results.push(python.decode(output.result.as_ref().unwrap()).unwrap());
                }
                (n, results, sink.take())
            })
        })
        .collect();
    for worker in workers {
        let (n, results, printed) = worker.join().unwrap();
        assert!(results.iter().all(|value| *value == Value::Int(n * (n + 1) / 2)));
        assert_eq!(printed, format!("{n}\n").repeat(20));
    }
    assert!(python.thread_state_count() >= 8);
}

#[test]
fn interpreter_work_from_concurrent_evaluations_is_serialized() {
    let python = python_or_skip!();
    let source = "total = 0\nfor i in range(1_000_000):\n    total += i\ntotal";
    let timed = || {
        let start = Instant::now();
        assert_eq!(eval_value(python, source), Value::Int(499_999_500_000));
        start.elapsed()
    };
    timed();
    let single = timed().min(timed());

    let start = Instant::now();
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(timed);
        }
    });
    let concurrent = start.elapsed();
    // four bytecode-bound evaluations cannot overlap, so they take well over one's time
    assert!(
        concurrent >= single * 2,
        "4 concurrent evaluations took {concurrent:?}, one took {single:?}"
    );
}

#[test]
fn analysis_treats_interpreter_builtins_as_defined() {
    let python = python_or_skip!();
    let analysis = python.analyze("total = len(items) + offset\nprint(total)").unwrap();
    assert_eq!(analysis.referenced.into_iter().collect::<Vec<_>>(), ["items", "offset"]);
    assert_eq!(analysis.defined.into_iter().collect::<Vec<_>>(), ["total"]);

    let err = python.analyze("def (").unwrap_err();
    assert!(matches!(err, Error::Syntax(_)), "unexpected error: {err}");
}

#[test]
fn session_reports_itself_live() {
    let python = python_or_skip!();
    assert!(python.is_live());
    python.ping();
    assert!(format!("{python:?}").contains("live: true"));
}
