//! In-memory mail host implementing `Remote`
//!
//! Files and directories live in maps behind a mutex. Every command
//! line is logged, then either answered from a canned response,
//! failed by an injected rule, or interpreted by a tiny shell.

use super::sed;
use super::shell::{self, Connector, Stage};
use async_trait::async_trait;
use mailhub_admin::{Error, Remote, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Mutex;

const PRIVILEGE: &str = "doas";

#[derive(Default)]
struct State {
    files: BTreeMap<String, String>,
    /// Directory path -> owner.
    dirs: BTreeMap<String, String>,
    commands: Vec<String>,
    rspamd_running: bool,
}

struct Outcome {
    ok: bool,
    stdout: String,
    stderr: String,
}

impl Outcome {
    fn ok(stdout: impl Into<String>) -> Self {
        Self {
            ok: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: impl Into<String>) -> Self {
        Self {
            ok: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

pub struct FakeHost {
    state: Mutex<State>,
    responses: Vec<(String, String)>,
    failures: Vec<String>,
    hostname: String,
}

impl FakeHost {
    /// Read a file; `None` if it does not exist.
    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    /// Non-empty lines of a file.
    pub fn lines(&self, path: &str) -> Vec<String> {
        self.file(path)
            .unwrap_or_default()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(ToString::to_string)
            .collect()
    }

    pub fn dir_owner(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().dirs.get(path).cloned()
    }

    /// Every command line received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn commands_containing(&self, needle: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    pub fn rspamd_running(&self) -> bool {
        self.state.lock().unwrap().rspamd_running
    }

    fn run_line(&self, line: &str) -> Outcome {
        let mut state = self.state.lock().unwrap();
        let mut stdout = String::new();
        let mut last = Outcome::ok("");

        for (i, (connector, pipeline)) in shell::parse(line).into_iter().enumerate() {
            if i > 0 {
                match connector {
                    Connector::And if !last.ok => continue,
                    Connector::Or if last.ok => continue,
                    _ => {}
                }
            }
            last = run_pipeline(&mut state, &self.hostname, &pipeline);
            stdout.push_str(&last.stdout);
        }

        Outcome {
            ok: last.ok,
            stdout,
            stderr: last.stderr,
        }
    }
}

#[async_trait]
impl Remote for FakeHost {
    async fn execute(&self, command: &str) -> Result<String> {
        self.state.lock().unwrap().commands.push(command.to_string());

        if self.failures.iter().any(|f| command.contains(f.as_str())) {
            return Err(Error::Command {
                command: command.to_string(),
                status: Some(1),
                stderr: "injected failure".to_string(),
            });
        }

        if let Some((_, out)) = self.responses.iter().find(|(k, _)| command.contains(k.as_str())) {
            return Ok(out.trim_end().to_string());
        }

        let outcome = self.run_line(command);
        if outcome.ok {
            Ok(outcome.stdout.trim_end().to_string())
        } else {
            Err(Error::Command {
                command: command.to_string(),
                status: Some(1),
                stderr: outcome.stderr.trim_end().to_string(),
            })
        }
    }

    fn privilege(&self) -> &str {
        PRIVILEGE
    }
}

fn run_pipeline(state: &mut State, hostname: &str, pipeline: &[Stage]) -> Outcome {
    let mut input = String::new();
    let mut last = Outcome::ok("");
    for stage in pipeline {
        last = run_stage(state, hostname, stage, &input);
        if stage.stdout_to.is_some() {
            last.stdout.clear();
        }
        input = last.stdout.clone();
    }
    last
}

fn run_stage(state: &mut State, hostname: &str, stage: &Stage, stdin: &str) -> Outcome {
    let mut argv: Vec<&str> = stage.argv.iter().map(String::as_str).collect();
    if argv.first() == Some(&PRIVILEGE) {
        argv.remove(0);
    }
    let Some((&program, args)) = argv.split_first() else {
        return Outcome::ok("");
    };

    match program {
        "true" => Outcome::ok(""),
        "hostname" => Outcome::ok(format!("{hostname}\n")),
        "cat" => match args.first().and_then(|p| state.files.get(*p)) {
            Some(content) => Outcome::ok(content.clone()),
            None => Outcome::fail(format!("cat: {}: No such file or directory", args.join(" "))),
        },
        "printf" => match args {
            [format, arg] => Outcome::ok(format.replace("\\n", "\n").replace("%s", arg)),
            [format] => Outcome::ok(format.replace("\\n", "\n")),
            _ => Outcome::fail("printf: unsupported arguments"),
        },
        "tee" => {
            let (append, path) = match args {
                ["-a", path] => (true, *path),
                [path] => (false, *path),
                _ => return Outcome::fail("tee: unsupported arguments"),
            };
            let file = state.files.entry(path.to_string()).or_default();
            if !append {
                file.clear();
            }
            file.push_str(stdin);
            Outcome::ok(stdin)
        }
        "sed" => {
            let ["-i", script, path] = args else {
                return Outcome::fail("sed: unsupported arguments");
            };
            let Some(content) = state.files.get(*path) else {
                return Outcome::fail(format!("sed: can't read {path}: No such file or directory"));
            };
            match sed::apply(script, content) {
                Some(updated) => {
                    state.files.insert((*path).to_string(), updated);
                    Outcome::ok("")
                }
                None => Outcome::fail(format!("sed: unsupported script {script}")),
            }
        }
        "mkdir" => {
            for path in args.iter().filter(|a| !a.starts_with('-')) {
                state
                    .dirs
                    .entry((*path).to_string())
                    .or_insert_with(|| "root".to_string());
            }
            Outcome::ok("")
        }
        "chown" => {
            let rest: Vec<&str> = args.iter().copied().filter(|a| !a.starts_with('-')).collect();
            let [owner, path] = rest.as_slice() else {
                return Outcome::fail("chown: unsupported arguments");
            };
            match state.dirs.get_mut(*path) {
                Some(o) => {
                    *o = (*owner).to_string();
                    Outcome::ok("")
                }
                None => Outcome::fail(format!("chown: {path}: No such file or directory")),
            }
        }
        "rm" => {
            for path in args.iter().filter(|a| !a.starts_with('-')) {
                let nested = format!("{path}/");
                state.dirs.retain(|d, _| d.as_str() != *path && !d.starts_with(&nested));
                state.files.retain(|f, _| f.as_str() != *path && !f.starts_with(&nested));
            }
            Outcome::ok("")
        }
        "postmap" => match args.first() {
            Some(path) if state.files.contains_key(*path) => Outcome::ok(""),
            Some(path) => Outcome::fail(format!("postmap: fatal: open {path}: No such file or directory")),
            None => Outcome::fail("postmap: usage"),
        },
        "postfix" | "doveadm" if args == ["reload"] => Outcome::ok(""),
        "rc-service" => match args {
            ["rspamd", "status"] if state.rspamd_running => Outcome::ok(" * status: started\n"),
            ["rspamd", "status"] => Outcome {
                ok: false,
                stdout: " * status: stopped\n".to_string(),
                stderr: String::new(),
            },
            ["rspamd", "start" | "restart"] => {
                state.rspamd_running = true;
                Outcome::ok("")
            }
            ["rspamd", "stop"] => {
                state.rspamd_running = false;
                Outcome::ok("")
            }
            ["rspamd", "reload"] if state.rspamd_running => Outcome::ok(""),
            ["rspamd", "reload"] => Outcome::fail(" * rspamd: not running"),
            _ => Outcome::fail("rc-service: unknown service"),
        },
        "tail" => {
            let ["-n", n, path] = args else {
                return Outcome::fail("tail: unsupported arguments");
            };
            let n: usize = n.parse().unwrap_or(10);
            match state.files.get(*path) {
                Some(content) => {
                    let lines: Vec<&str> = content.lines().collect();
                    let start = lines.len().saturating_sub(n);
                    Outcome::ok(lines[start..].iter().map(|l| format!("{l}\n")).collect::<String>())
                }
                None => Outcome::fail(format!("tail: can't open '{path}': No such file or directory")),
            }
        }
        "grep" => {
            let (quiet, pattern) = match args {
                ["-q", pattern] => (true, *pattern),
                [pattern] => (false, *pattern),
                _ => return Outcome::fail("grep: unsupported arguments"),
            };
            let Ok(re) = Regex::new(pattern) else {
                return Outcome::fail("grep: bad pattern");
            };
            let matched: String = stdin
                .lines()
                .filter(|l| re.is_match(l))
                .map(|l| format!("{l}\n"))
                .collect();
            if matched.is_empty() {
                Outcome {
                    ok: false,
                    stdout: String::new(),
                    stderr: String::new(),
                }
            } else if quiet {
                Outcome::ok("")
            } else {
                Outcome::ok(matched)
            }
        }
        "head" => {
            let n = match args {
                ["-n", n] => n.parse().unwrap_or(10),
                [flag] => flag.trim_start_matches('-').parse().unwrap_or(10),
                _ => 10,
            };
            Outcome::ok(stdin.lines().take(n).map(|l| format!("{l}\n")).collect::<String>())
        }
        other => Outcome::fail(format!("sh: {other}: not found")),
    }
}

/// Builder for a [`FakeHost`].
///
/// ```ignore
/// let host = FakeHostBuilder::mail_host()
///     .file("/etc/postfix/virtual_domains", "example.com\n")
///     .respond("rspamd --version", "Rspamd daemon version 3.8.4")
///     .fail_on("doveadm reload")
///     .build();
/// ```
pub struct FakeHostBuilder {
    state: State,
    responses: Vec<(String, String)>,
    failures: Vec<String>,
}

impl FakeHostBuilder {
    pub fn new() -> Self {
        Self {
            state: State::default(),
            responses: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// A host with the mail and Rspamd files present but empty, and
    /// Rspamd running.
    pub fn mail_host() -> Self {
        Self::new()
            .file("/etc/postfix/virtual_domains", "")
            .file("/etc/postfix/virtual_mailbox", "")
            .file("/etc/postfix/virtual_alias", "")
            .file("/etc/dovecot/users", "")
            .file("/etc/rspamd/spf_whitelist.txt", "")
            .dir("/var/mail/vhosts", "5000:5000")
            .rspamd_running(true)
    }

    pub fn file(mut self, path: &str, content: &str) -> Self {
        self.state.files.insert(path.to_string(), content.to_string());
        self
    }

    pub fn without_file(mut self, path: &str) -> Self {
        self.state.files.remove(path);
        self
    }

    pub fn dir(mut self, path: &str, owner: &str) -> Self {
        self.state.dirs.insert(path.to_string(), owner.to_string());
        self
    }

    pub fn rspamd_running(mut self, running: bool) -> Self {
        self.state.rspamd_running = running;
        self
    }

    /// Answer any command line containing `needle` with `output`.
    pub fn respond(mut self, needle: &str, output: &str) -> Self {
        self.responses.push((needle.to_string(), output.to_string()));
        self
    }

    /// Fail any command line containing `needle`.
    pub fn fail_on(mut self, needle: &str) -> Self {
        self.failures.push(needle.to_string());
        self
    }

    pub fn build(self) -> FakeHost {
        FakeHost {
            state: Mutex::new(self.state),
            responses: self.responses,
            failures: self.failures,
            hostname: "mail.test".to_string(),
        }
    }
}
