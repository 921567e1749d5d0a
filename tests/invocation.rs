//! Invocation supervisor tests
//!
//! Covers both entry points: synchronous immediate invocation under the VM
//! lock, and suspending invocation driven through host futures, including
//! the no-yield fast path, the pending-suspension interleaving with
//! immediate calls, evaluation-context refresh, and the error policy
//! separating script errors from host errors.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use edlua::{
    host_fn, mlua, suspendable_fn, EvaluationContext, ExecutionContext, HostFuture, NullHost,
    Runtime, RuntimeError, RuntimeOptions, ScriptHost, SuspendResult, TableKey, Value,
};

fn env(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (TableKey::from(key), value))
            .collect(),
    )
}

fn make_runtime(env_value: Option<Value>) -> Runtime {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Runtime::make(
        Arc::new(NullHost),
        RuntimeOptions {
            env: env_value,
            ..Default::default()
        },
    )
    .expect("runtime construction")
}

fn load_function(runtime: &Runtime, source: &str) -> mlua::Function {
    let chunk = runtime.read(source, Some("test")).expect("chunk compiles");
    match runtime.eval(&chunk).expect("chunk evaluates") {
        mlua::Value::Function(func) => func,
        other => panic!("expected function, got {other:?}"),
    }
}

#[test]
fn eval_returns_script_value() {
    let runtime = make_runtime(None);
    let chunk = runtime.read("return 1", None).unwrap();
    let value = runtime.eval(&chunk).unwrap();
    assert_eq!(runtime.from_lua(value).unwrap(), Value::Int(1));
}

#[test]
fn concurrent_immediate_calls_serialise_on_the_lock() {
    let runtime = make_runtime(None);
    let func = load_function(
        &runtime,
        "counter = 0\nreturn function()\n  counter = counter + 1\n  return counter\nend",
    );

    let threads = 8;
    let calls_per_thread = 250;
    let mut handles = Vec::new();
    for _ in 0..threads {
        let runtime = runtime.clone();
        let func = func.clone();
        handles.push(std::thread::spawn(move || {
            (0..calls_per_thread)
                .map(|_| {
                    match runtime.invoke_immediate(&func, Vec::new(), None).unwrap() {
                        mlua::Value::Integer(i) => i,
                        other => panic!("expected integer, got {other:?}"),
                    }
                })
                .collect::<Vec<i64>>()
        }));
    }

    let mut seen: Vec<i64> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    seen.sort_unstable();
    let expected: Vec<i64> = (1..=(threads * calls_per_thread) as i64).collect();
    assert_eq!(seen, expected);
}

#[test]
fn pending_suspension_leaves_runtime_available() {
    let gate: Arc<Mutex<Option<tokio::sync::oneshot::Receiver<SuspendResult>>>> =
        Arc::new(Mutex::new(None));
    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel();
    *gate.lock().unwrap() = Some(gate_rx);

    let gate_for_fn = gate.clone();
    let runtime = make_runtime(Some(env(vec![
        (
            "suspend_with_promise",
            suspendable_fn(move |_args| {
                let rx = gate_for_fn
                    .lock()
                    .unwrap()
                    .take()
                    .expect("suspendable called once");
                let future: HostFuture = Box::pin(async move {
                    rx.await.map_err(|_| RuntimeError::host("gate dropped"))
                });
                Ok(future)
            }),
        ),
        (
            "no_suspend",
            host_fn(|_args| Ok(Value::from("immediate-result"))),
        ),
    ])));

    let suspending = load_function(&runtime, "return function() return suspend_with_promise() end");
    let mut call = runtime.invoke_suspending(suspending, Vec::new());
    assert!(call.try_result().is_none(), "future must still be pending");

    let immediate = load_function(&runtime, "return function() return no_suspend() end");
    let value = runtime.invoke_immediate(&immediate, Vec::new(), None).unwrap();
    assert_eq!(
        runtime.from_lua(value).unwrap(),
        Value::from("immediate-result")
    );

    gate_tx
        .send(SuspendResult::success(Value::from("suspended-result"), false))
        .unwrap();
    let value = call.wait().unwrap();
    assert_eq!(
        runtime.from_lua(value).unwrap(),
        Value::from("suspended-result")
    );
}

#[test]
fn suspending_invocation_without_suspensions_completes_synchronously() {
    let runtime = make_runtime(None);
    let func = load_function(
        &runtime,
        "local function fib(n)\n  if n < 2 then return n end\n  return fib(n - 1) + fib(n - 2)\nend\nreturn function() return fib(30) end",
    );
    let mut call = runtime.invoke_suspending(func, Vec::new());
    match call.try_result() {
        Some(Ok(mlua::Value::Integer(n))) => assert_eq!(n, 832040),
        other => panic!("expected completed future, got {other:?}"),
    }
}

#[test]
fn immediate_invocation_rejects_suspendables() {
    let runtime = make_runtime(Some(env(vec![(
        "sleepy",
        suspendable_fn(|_args| Ok(SuspendResult::success(Value::Nil, false).into_future())),
    )])));
    let func = load_function(&runtime, "return function() return sleepy() end");
    let error = runtime
        .invoke_immediate(&func, Vec::new(), None)
        .unwrap_err();
    assert!(
        error
            .to_string()
            .contains("Cannot use long-running editor function in immediate context"),
        "unexpected error: {error}"
    );
}

#[test]
fn yield_on_the_main_thread_translates_to_context_error() {
    let runtime = make_runtime(None);
    let func = load_function(&runtime, "return function() coroutine.yield(1) end");
    let error = runtime
        .invoke_immediate(&func, Vec::new(), None)
        .unwrap_err();
    assert_eq!(
        error.script_message(),
        Some("Cannot use long-running editor function in this context")
    );
}

#[test]
fn error_suspend_result_raises_inside_the_script() {
    let runtime = make_runtime(Some(env(vec![(
        "fail_op",
        suspendable_fn(|_args| Ok(SuspendResult::error("disk on fire").into_future())),
    )])));
    let func = load_function(
        &runtime,
        "return function()\n  local ok, err = pcall(fail_op)\n  return { ok, err }\nend",
    );
    let value = runtime.invoke_suspending(func, Vec::new()).wait().unwrap();
    assert_eq!(
        runtime.from_lua(value).unwrap(),
        Value::List(vec![Value::Bool(false), Value::from("disk on fire")])
    );
}

#[test]
fn host_errors_fail_the_invocation_without_resuming() {
    let runtime = make_runtime(Some(env(vec![(
        "broken",
        suspendable_fn(|_args| {
            let future: HostFuture =
                Box::pin(async { Err(RuntimeError::host("backend gone")) });
            Ok(future)
        }),
    )])));
    let func = load_function(&runtime, "return function() return broken() end");
    let error = runtime.invoke_suspending(func, Vec::new()).wait().unwrap_err();
    match error {
        RuntimeError::Host(message) => assert_eq!(message, "backend gone"),
        other => panic!("expected host error, got {other:?}"),
    }
}

#[test]
fn uncaught_script_error_fails_the_suspending_future() {
    let runtime = make_runtime(None);
    let func = load_function(&runtime, "return function() error('kaboom') end");
    let error = runtime.invoke_suspending(func, Vec::new()).wait().unwrap_err();
    match error {
        RuntimeError::Script(message) => {
            assert!(message.contains("kaboom"), "unexpected message: {message}")
        }
        other => panic!("expected script error, got {other:?}"),
    }
}

#[test]
fn concurrent_suspending_invocations_do_not_interfere() {
    type Gates = Mutex<std::collections::HashMap<String, tokio::sync::oneshot::Receiver<SuspendResult>>>;
    let gates: Arc<Gates> = Arc::new(Mutex::new(std::collections::HashMap::new()));
    let (tx_a, rx_a) = tokio::sync::oneshot::channel();
    let (tx_b, rx_b) = tokio::sync::oneshot::channel();
    gates.lock().unwrap().insert("a".to_string(), rx_a);
    gates.lock().unwrap().insert("b".to_string(), rx_b);

    let gates_for_fn = gates.clone();
    let runtime = make_runtime(Some(env(vec![(
        "wait_for",
        suspendable_fn(move |args| {
            let key = match args.first() {
                Some(mlua::Value::String(s)) => s.to_string_lossy().to_string(),
                _ => return Err(RuntimeError::script("wait_for expects a string")),
            };
            let rx = gates_for_fn
                .lock()
                .unwrap()
                .remove(&key)
                .expect("one waiter per key");
            let future: HostFuture =
                Box::pin(async move { rx.await.map_err(|_| RuntimeError::host("gate dropped")) });
            Ok(future)
        }),
    )])));

    let func = load_function(&runtime, "return function(key) return wait_for(key) end");
    let call_a = runtime.invoke_suspending(func.clone(), vec![Value::from("a")]);
    let call_b = runtime.invoke_suspending(func, vec![Value::from("b")]);

    // complete them out of order
    tx_b.send(SuspendResult::success(Value::from("beta"), false))
        .unwrap();
    tx_a.send(SuspendResult::success(Value::from("alpha"), false))
        .unwrap();

    assert_eq!(
        runtime.from_lua(call_a.wait().unwrap()).unwrap(),
        Value::from("alpha")
    );
    assert_eq!(
        runtime.from_lua(call_b.wait().unwrap()).unwrap(),
        Value::from("beta")
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluation-context refresh
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Snapshot {
    id: u64,
    value: i64,
}

/// Host with a single node property snapshotted into each evaluation
/// context; commits are recorded for inspection.
struct GraphHost {
    value: AtomicI64,
    next_id: AtomicU64,
    commits: Mutex<Vec<u64>>,
}

impl GraphHost {
    fn new(initial: i64) -> Self {
        GraphHost {
            value: AtomicI64::new(initial),
            next_id: AtomicU64::new(0),
            commits: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptHost for GraphHost {
    fn evaluation_context(&self) -> EvaluationContext {
        EvaluationContext::new(Snapshot {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            value: self.value.load(Ordering::SeqCst),
        })
    }

    fn commit_evaluation_context(&self, ctx: EvaluationContext) {
        let snapshot = ctx.downcast_ref::<Snapshot>().expect("snapshot context");
        self.commits.lock().unwrap().push(snapshot.id);
    }
}

#[test]
fn refresh_adopts_a_fresh_evaluation_context() {
    let graph = Arc::new(GraphHost::new(1));

    let get_value = host_fn(|_args| {
        let ctx = ExecutionContext::current()
            .ok_or_else(|| RuntimeError::host("no execution context"))?;
        let snapshot = ctx
            .evaluation_context()
            .downcast_ref::<Snapshot>()
            .ok_or_else(|| RuntimeError::host("unexpected context type"))?;
        Ok(Value::Int(snapshot.value))
    });

    let graph_for_set = graph.clone();
    let set_value = suspendable_fn(move |args| {
        let new_value = match args.first() {
            Some(mlua::Value::Integer(i)) => *i,
            _ => return Err(RuntimeError::script("set_value expects an integer")),
        };
        let host = graph_for_set.clone();
        let future: HostFuture = Box::pin(async move {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let ui_host = host.clone();
            host.run_on_ui(Box::new(move || {
                ui_host.value.store(new_value, Ordering::SeqCst);
                let _ = tx.send(());
            }));
            rx.await.map_err(|_| RuntimeError::host("ui task dropped"))?;
            Ok(SuspendResult::success(Value::Bool(true), true))
        });
        Ok(future)
    });

    let runtime = Runtime::make(
        graph.clone(),
        RuntimeOptions {
            env: Some(env(vec![(
                "node",
                env(vec![("get_value", get_value), ("set_value", set_value)]),
            )])),
            ..Default::default()
        },
    )
    .unwrap();

    let func = load_function(
        &runtime,
        "return function()\n  return { node.get_value(), node.set_value(2), node.get_value() }\nend",
    );
    let value = runtime.invoke_suspending(func, Vec::new()).wait().unwrap();
    assert_eq!(
        runtime.from_lua(value).unwrap(),
        Value::List(vec![Value::Int(1), Value::Bool(true), Value::Int(2)])
    );

    // the stale context was committed exactly once, on the refresh
    let commits = graph.commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
}

#[test]
fn immediate_invocation_commits_a_derived_context() {
    let graph = Arc::new(GraphHost::new(7));
    let runtime = Runtime::make(graph.clone(), RuntimeOptions::default()).unwrap();
    let func = load_function(&runtime, "return function() return 1 end");

    runtime.invoke_immediate(&func, Vec::new(), None).unwrap();
    assert_eq!(graph.commits.lock().unwrap().len(), 1);

    // a caller-supplied context is the caller's to commit
    let supplied = graph.evaluation_context();
    runtime
        .invoke_immediate(&func, Vec::new(), Some(supplied))
        .unwrap();
    assert_eq!(graph.commits.lock().unwrap().len(), 1);
}
