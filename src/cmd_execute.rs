use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::str;
use std::{error::Error, fmt};

pub trait CommandStreamActions<T: Read> {
    fn stdout(&mut self) -> T;
    fn wait(&mut self) -> io::Result<ExitStatus>;
}

impl CommandStreamActions<ChildStdout> for Child {
    fn stdout(&mut self) -> ChildStdout {
        self.stdout.take().unwrap()
    }
    fn wait(&mut self) -> io::Result<ExitStatus> {
        self.wait()
    }
}

#[derive(Debug)]
pub struct ExecuteError(ExitStatus);
impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Command exited with error code: {}", self.0)
    }
}
impl Error for ExecuteError {}

/// A program with its argument vector. Arguments are passed through as-is,
/// so values with spaces (passwords, paths) survive intact.
pub struct Cmd {
    program: String,
    args: Vec<String>,
}

impl Cmd {
    pub fn new(program: &str) -> Cmd {
        Cmd {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: &str) -> Cmd {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I: IntoIterator<Item = String>>(mut self, args: I) -> Cmd {
        self.args.extend(args);
        self
    }

    fn build(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

pub trait Executor {
    fn execute(&self) -> Result<String, Box<dyn Error>>;
    fn execute_by_line(&self) -> Result<Vec<String>, Box<dyn Error>>;
    fn spawn(&self) -> Result<Child, Box<dyn Error>>;
    fn spawn_with_stdin(&self) -> Result<Child, Box<dyn Error>>;
}

impl Executor for Cmd {
    fn execute(&self) -> Result<String, Box<dyn Error>> {
        let output = self.build().output()?;
        if output.status.success() {
            let content = str::from_utf8(&output.stdout)?;
            Ok(content.to_string())
        } else {
            Err(Box::new(ExecuteError(output.status)))
        }
    }

    fn execute_by_line(&self) -> Result<Vec<String>, Box<dyn Error>> {
        let result: Vec<String> = self
            .execute()?
            .split('\n')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        Ok(result)
    }

    fn spawn(&self) -> Result<Child, Box<dyn Error>> {
        Ok(self.build().stdout(Stdio::piped()).stderr(Stdio::null()).spawn()?)
    }

    fn spawn_with_stdin(&self) -> Result<Child, Box<dyn Error>> {
        Ok(self
            .build()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?)
    }
}
