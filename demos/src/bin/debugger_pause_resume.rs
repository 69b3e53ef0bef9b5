//! Demonstrates pausing and resuming a script from a separate controller thread.
//!
//! The engine runs on the main thread. Whenever the debugger pauses, the delegate sends a
//! notice to the controller thread and blocks until the controller answers with a command:
//! evaluate an expression in the paused frame, step, or continue. This is the shape of an
//! inspector session, where the protocol front end lives on another thread.

use std::{
    collections::VecDeque,
    error::Error,
    sync::{
        Arc, Mutex, PoisonError,
        mpsc::{self, Receiver, Sender},
    },
    thread,
};

use indoc::indoc;
use log::{LevelFilter, info, warn};
use serde_json::Value as Json;
use simple_logger::SimpleLogger;
use tripwire_engine::{
    BreakpointId, DebugDelegate, PauseContext, ScriptId, StepAction,
    debugger::SourceLocation,
    vm::{BytecodeBuilder, Register},
};
use tripwire_harness::{FunctionDecl, Isolate, Program, Value};

const SOURCE: &str = indoc! {"
    function double(n) {
      var r = n + n;
      return r;
    }
    function sum(a, b) {
      var x = double(a);
      var y = double(b);
      return x + y;
    }
"};

/// What the controller tells a paused engine to do.
#[derive(Debug, Clone)]
enum Command {
    Evaluate(String),
    Step(StepAction),
    Continue,
}

/// What the engine tells the controller.
#[derive(Debug)]
enum Notice {
    Paused {
        function: String,
        location: Option<SourceLocation>,
        hits: Vec<BreakpointId>,
    },
    Evaluated {
        expression: String,
        result: Result<Json, String>,
    },
}

/// A delegate that hands every pause to the controller thread.
#[derive(Debug)]
struct Remote {
    notices: Sender<Notice>,
    commands: Mutex<Receiver<Command>>,
}

impl Remote {
    fn notify(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            warn!("controller is gone");
        }
    }

    /// Blocks until the controller answers. A vanished controller lets execution continue.
    fn next_command(&self) -> Command {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv()
            .unwrap_or(Command::Continue)
    }
}

impl DebugDelegate for Remote {
    fn break_program_requested(&self, pause: &mut PauseContext<'_>, hit_breakpoints: &[BreakpointId]) {
        let (function, location) = describe(pause);
        self.notify(Notice::Paused {
            function,
            location,
            hits: hit_breakpoints.to_vec(),
        });
        loop {
            match self.next_command() {
                Command::Evaluate(expression) => {
                    let result = pause
                        .evaluate(&expression, true)
                        .map_err(|err| err.to_string());
                    self.notify(Notice::Evaluated { expression, result });
                }
                Command::Step(action) => {
                    pause.prepare_step(action);
                    return;
                }
                Command::Continue => return,
            }
        }
    }
}

fn describe(pause: &mut PauseContext<'_>) -> (String, Option<SourceLocation>) {
    let Some(summary) = pause.top_summary() else {
        return ("<native>".to_owned(), None);
    };
    let position = pause.top_position();
    let host = pause.host();
    let info = host.function_info(summary.function);
    let location = info
        .script
        .map(|script| host.source_location(script, position));
    (info.name, location)
}

/// Answers every notice with the next scripted command, then continues.
fn control(notices: &Receiver<Notice>, commands: &Sender<Command>, mut script: VecDeque<Command>) {
    for notice in notices {
        match notice {
            Notice::Paused {
                function,
                location: Some(location),
                hits,
            } => info!(
                "paused in {function} at {}:{} (breakpoints {hits:?})",
                location.line + 1,
                location.column + 1
            ),
            Notice::Paused { function, .. } => info!("paused in {function}"),
            Notice::Evaluated { expression, result } => match result {
                Ok(value) => info!("{expression} = {value}"),
                Err(err) => info!("{expression} failed: {err}"),
            },
        }
        let command = script.pop_front().unwrap_or(Command::Continue);
        info!("-> {command:?}");
        if commands.send(command).is_err() {
            break;
        }
    }
}

/// Assembles `double` and `sum` from [`SOURCE`].
fn program() -> (Program, ScriptId) {
    let mut program = Program::new();
    let script = program.add_script(SOURCE);
    let at = |needle: &str| program.position_of(script, needle);

    let (double_start, sum_start) = (at("function double"), at("function sum"));
    let (double_end, sum_end) = (sum_start - 1, at("return x") + 15);
    let positions = [
        at("var r"),
        at("return r"),
        at("var x"),
        at("double(a)"),
        at("var y"),
        at("double(b)"),
        at("return x"),
    ];
    let [var_r, return_r, var_x, call_a, var_y, call_b, return_x] = positions;

    let toplevel = program.declare_toplevel(script);
    let double = program.declare(
        script,
        FunctionDecl::new("double", double_start, double_end)
            .token(double_start)
            .locals(&["n", "r"]),
    );
    let sum = program.declare(
        script,
        FunctionDecl::new("sum", sum_start, sum_end)
            .token(sum_start)
            .locals(&["a", "b", "x", "y"]),
    );

    let mut b = BytecodeBuilder::new(1, 2);
    b.statement(var_r).ldar(Register(0)).add(Register(0)).star(Register(1));
    b.ldar(Register(1));
    b.statement(return_r).ret();
    program.define(double, b.build());

    let mut b = BytecodeBuilder::new(2, 6);
    b.statement(var_x).lda_global("double").star(Register(4));
    b.mov(Register(0), Register(5));
    b.expression(call_a).call(Register(4), Register(5), 1);
    b.star(Register(2));
    b.statement(var_y).lda_global("double").star(Register(4));
    b.mov(Register(1), Register(5));
    b.expression(call_b).call(Register(4), Register(5), 1);
    b.star(Register(3));
    b.ldar(Register(3)).add(Register(2));
    b.statement(return_x).ret();
    program.define(sum, b.build());

    let mut b = BytecodeBuilder::new(0, 0);
    b.create_closure(double).sta_global("double");
    b.create_closure(sum).sta_global("sum");
    b.lda_undefined().ret();
    program.define(toplevel, b.build());

    (program, script)
}

fn main() -> Result<(), Box<dyn Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).init()?;

    let script = VecDeque::from([
        Command::Evaluate("a + b".to_owned()),
        Command::Step(StepAction::Into),
        Command::Evaluate("n".to_owned()),
        Command::Step(StepAction::Out),
        Command::Step(StepAction::Out),
        Command::Step(StepAction::Over),
        Command::Continue,
    ]);
    let (notice_sender, notice_receiver) = mpsc::channel();
    let (command_sender, command_receiver) = mpsc::channel();
    let controller = thread::spawn(move || control(&notice_receiver, &command_sender, script));

    let (program, source) = program();
    let mut isolate = Isolate::new(program);
    isolate.attach(Arc::new(Remote {
        notices: notice_sender,
        commands: Mutex::new(command_receiver),
    }));
    isolate.run(source)?;

    let position = isolate.vm.program().position_of(source, "var x");
    let (id, _) = isolate
        .set_breakpoint(source, position, None)
        .ok_or("no break location in `sum`")?;
    info!("breakpoint {id} set");

    let result = isolate.call("sum", &[Value::Smi(3), Value::Smi(4)])?;
    info!("sum(3, 4) = {}", result.to_json());

    // Dropping the isolate drops the delegate and closes the controller's channel.
    drop(isolate);
    controller.join().map_err(|_| "controller panicked")?;
    Ok(())
}
