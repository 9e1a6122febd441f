pub mod lexer;
pub mod parser;
pub mod token;

use std::fmt::{self, Display, Formatter};
use std::os::unix::io::RawFd;

use nix::{fcntl::OFlag, sys::stat::Mode};

pub use parser::parse;

// Hard cap on the argument vector of a single command, terminator included.
pub const MAX_ARGS: usize = 16;

// A parsed command line. Each node exclusively owns its children; the REPL
// owns the root for the duration of one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    Exec(ExecCmd),
    Redr(RedrCmd),
    Pipe { left: Box<Cmd>, right: Box<Cmd> },
    List { left: Box<Cmd>, right: Box<Cmd> },
    Back(Box<Cmd>),
    Subs(Box<Cmd>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecCmd {
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrCmd {
    pub cmd: Box<Cmd>,
    pub file: String,
    pub flags: OFlag,
    pub mode: Mode,
    pub fd: RawFd,
}

impl Cmd {
    pub fn is_empty_exec(&self) -> bool {
        matches!(self, Cmd::Exec(exec) if exec.argv.is_empty())
    }
}

impl RedrCmd {
    fn operator(&self) -> &'static str {
        if self.flags.contains(OFlag::O_APPEND) {
            ">>"
        } else if self.flags.contains(OFlag::O_WRONLY) {
            ">"
        } else {
            "<"
        }
    }
}

// Prints the tree back as shell syntax. The output is canonical: parsing it
// again yields an equal tree, and printing that tree yields the same string.
impl Display for Cmd {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Cmd::Exec(exec) => write!(f, "{}", exec.argv.join(" ")),
            Cmd::Redr(redr) => {
                write!(f, "{} {} {}", redr.cmd, redr.operator(), redr.file)
            }
            Cmd::Pipe { left, right } => write!(f, "{} | {}", left, right),
            Cmd::List { left, right } => write!(f, "{} ; {}", left, right),
            Cmd::Back(cmd) => write!(f, "{} &", cmd),
            Cmd::Subs(cmd) => write!(f, "( {} )", cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(args: &[&str]) -> Cmd {
        Cmd::Exec(ExecCmd {
            argv: args.iter().map(|a| a.to_string()).collect(),
        })
    }

    #[test]
    fn test_exec_display() {
        assert_eq!(exec(&["ls", "-la"]).to_string(), "ls -la");
        assert_eq!(exec(&[]).to_string(), "");
    }

    #[test]
    fn test_redr_display_picks_operator_from_flags() {
        let out = Cmd::Redr(RedrCmd {
            cmd: Box::new(exec(&["echo", "hola"])),
            file: "f".to_string(),
            flags: OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            mode: Mode::S_IRWXU,
            fd: 1,
        });
        assert_eq!(out.to_string(), "echo hola > f");

        let app = Cmd::Redr(RedrCmd {
            cmd: Box::new(exec(&["echo", "hola"])),
            file: "f".to_string(),
            flags: OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
            mode: Mode::S_IRWXU,
            fd: 1,
        });
        assert_eq!(app.to_string(), "echo hola >> f");

        let inp = Cmd::Redr(RedrCmd {
            cmd: Box::new(exec(&["wc"])),
            file: "f".to_string(),
            flags: OFlag::O_RDONLY,
            mode: Mode::S_IRWXU,
            fd: 0,
        });
        assert_eq!(inp.to_string(), "wc < f");
    }

    #[test]
    fn test_compound_display() {
        let cmd = Cmd::List {
            left: Box::new(Cmd::Back(Box::new(exec(&["sleep", "1"])))),
            right: Box::new(Cmd::Pipe {
                left: Box::new(exec(&["echo", "a"])),
                right: Box::new(exec(&["wc", "-c"])),
            }),
        };
        assert_eq!(cmd.to_string(), "sleep 1 & ; echo a | wc -c");

        let subs = Cmd::Subs(Box::new(exec(&["cwd"])));
        assert_eq!(subs.to_string(), "( cwd )");
    }
}
