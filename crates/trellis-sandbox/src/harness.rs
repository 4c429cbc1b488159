//! Interpreter-side harness.
//!
//! The child reads one JSON request `{code, input, max_output_bytes}` from
//! stdin and writes one JSON envelope to stdout:
//! `{ok, result?, error_type?, message?, stdout, stderr}`.

pub(crate) const INTERPRETER_FLAGS: &[&str] = &["-I", "-S", "-B"];

/// Names exposed to code units as builtins
pub(crate) const ALLOWED_BUILTINS: &[&str] = &[
    "abs", "all", "any", "bool", "chr", "dict", "divmod", "enumerate", "filter", "float",
    "format", "frozenset", "int", "isinstance", "len", "list", "map", "max", "min", "ord",
    "pow", "print", "range", "repr", "reversed", "round", "set", "slice", "sorted", "str",
    "sum", "tuple", "zip", "ArithmeticError", "Exception", "IndexError", "KeyError",
    "StopIteration", "TypeError", "ValueError", "ZeroDivisionError",
];

/// Taken out of the interpreter's own builtins before user code runs, so a
/// frame walked back to the harness finds nothing to escalate with.
pub(crate) const STRIPPED_BUILTINS: &[&str] = &[
    "__import__", "__build_class__", "__loader__", "__spec__", "open", "exec", "eval",
    "compile", "globals", "locals", "vars", "getattr", "setattr", "delattr", "breakpoint",
    "input", "help", "memoryview", "exit", "quit",
];

const HARNESS_TEMPLATE: &str = r#"
import builtins, io, json, os, sys

def _main():
    stdout, dumps, exit_now, string_io = sys.stdout, json.dumps, os._exit, io.StringIO
    run_code, compile_code, real_print = exec, compile, print
    request = json.loads(sys.stdin.read())
    limit = int(request.get("max_output_bytes", 65536))
    code, value = request["code"], request.get("input")
    del request

    real = builtins.__dict__
    allowed = {name: real[name] for name in __ALLOWED__ if name in real}
    harness_globals = globals()
    for name in ("builtins", "io", "json", "os", "sys"):
        harness_globals.pop(name, None)
    for name in __STRIPPED__:
        real.pop(name, None)

    out, err = string_io(), string_io()
    def unit_print(*args, sep=" ", end="\n", file=None, flush=False):
        real_print(*args, sep=sep, end=end, file=out)
    allowed["print"] = unit_print
    namespace = {"__builtins__": allowed, "input": value}
    try:
        run_code(compile_code(code, "<unit>", "exec"), namespace)
        result = namespace.get("result")
        dumps(result)
        envelope = {"ok": True, "result": result}
    except MemoryError:
        envelope = {"ok": False, "error_type": "MemoryError", "message": "memory limit exceeded"}
    except BaseException as exc:
        envelope = {"ok": False, "error_type": type(exc).__name__, "message": str(exc)}
    envelope["stdout"] = out.getvalue()[:limit]
    envelope["stderr"] = err.getvalue()[:limit]
    stdout.write(dumps(envelope))
    stdout.flush()
    exit_now(0)

_main()
"#;

fn python_list(names: &[&str]) -> String {
    let quoted: Vec<String> = names.iter().map(|name| format!("{:?}", name)).collect();
    format!("[{}]", quoted.join(", "))
}

/// Harness source with the allow-list substituted in
pub(crate) fn harness_source() -> String {
    HARNESS_TEMPLATE
        .replace("__ALLOWED__", &python_list(ALLOWED_BUILTINS))
        .replace("__STRIPPED__", &python_list(STRIPPED_BUILTINS))
}
