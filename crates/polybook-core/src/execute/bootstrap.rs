//! Preamble installed into every persistent Python interpreter.
//!
//! The interpreter runs in interactive mode with its stdin attached to the
//! session. Submissions arrive as one line each: a call to the run entry
//! point with the base64-encoded source and the completion marker.
//!
//! `SystemExit` raised by a submission is reported like any other exception
//! and the interpreter keeps running.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::markers::CompletionMarker;

/// Name of the run entry point defined by the preamble.
pub const RUN_ENTRY: &str = "__polybook_run__";

/// Preamble source. Markers are spliced in at the `@NAME@` placeholders.
const PREAMBLE: &str = r#"import sys, builtins, base64, io, traceback

sys.ps1 = ''
sys.ps2 = ''
sys.stderr = sys.stdout

_polybook_read_line = builtins.input


def input(prompt=''):
    sys.stdout.write('@INPUT_START@' + str(prompt) + '@INPUT_END@')
    sys.stdout.flush()
    return _polybook_read_line()


builtins.input = input

try:
    import matplotlib
    matplotlib.use('Agg')
    import matplotlib.pyplot as _polybook_plt
except Exception:
    _polybook_plt = None


def show(*args, **kwargs):
    if _polybook_plt is None:
        return
    try:
        for number in _polybook_plt.get_fignums():
            buf = io.BytesIO()
            _polybook_plt.figure(number).savefig(buf, format='png')
            payload = base64.b64encode(buf.getvalue()).decode('ascii')
            sys.stdout.write('@PLOT_START@' + payload + '@PLOT_END@\n')
        sys.stdout.flush()
        _polybook_plt.close('all')
    except Exception:
        traceback.print_exc()


if _polybook_plt is not None:
    _polybook_plt.show = show


def @RUN_ENTRY@(encoded, marker):
    try:
        source = base64.b64decode(encoded).decode('utf-8')
        exec(compile(source, '<cell>', 'exec'), globals())
        show()
    except (Exception, SystemExit):
        traceback.print_exc()
    finally:
        sys.stdout.write(marker + '\n')
        sys.stdout.flush()


sys.stdout.write('@READY@\n')
sys.stdout.flush()
"#;

/// Full preamble text with the marker protocol filled in.
pub fn preamble() -> String {
    use crate::markers::{INPUT_END, INPUT_START, PLOT_END, PLOT_START, READY};

    PREAMBLE
        .replace("@INPUT_START@", INPUT_START)
        .replace("@INPUT_END@", INPUT_END)
        .replace("@PLOT_START@", PLOT_START)
        .replace("@PLOT_END@", PLOT_END)
        .replace("@RUN_ENTRY@", RUN_ENTRY)
        .replace("@READY@", READY)
}

/// The single line that installs the preamble in a fresh interpreter.
pub fn install_line() -> String {
    let encoded = STANDARD.encode(preamble());
    format!("import base64; exec(base64.b64decode('{encoded}').decode(), globals())\n")
}

/// The single line that runs one submission.
pub fn run_line(source: &str, marker: &CompletionMarker) -> String {
    let encoded = STANDARD.encode(source);
    format!("{RUN_ENTRY}('{encoded}', '{marker}')\n")
}
