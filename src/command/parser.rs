use nix::{fcntl::OFlag, sys::stat::Mode};

use crate::errors::ShellError;

use super::{
    lexer,
    token::Token,
    Cmd, ExecCmd, RedrCmd, MAX_ARGS,
};

// Recursive descent over the token stream, one function per non-terminal:
//
//     line  := pipe ( '&' )* ( ';' line )?
//     pipe  := exec ( '|' pipe )?
//     exec  := subs | redr* word (word | redr)*
//     subs  := '(' line ')' redr*
//     redr  := ('<' | '>' | '>>') word
pub fn parse(input_str: &str) -> Result<Cmd, ShellError> {
    let tokens = lexer::scan(input_str);
    let mut parser = Parser { tokens, idx: 0 };

    let cmd = parser.parse_line()?;
    if let Some(token) = parser.peek() {
        return Err(ShellError::Syntax(format!(
            "entrada inesperada tras la orden: '{}'",
            token
        )));
    }

    Ok(cmd)
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.idx)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.idx).cloned();
        if token.is_some() {
            self.idx += 1;
        }
        token
    }

    fn parse_line(&mut self) -> Result<Cmd, ShellError> {
        let mut cmd = self.parse_pipe()?;

        while let Some(Token::Amp) = self.peek() {
            self.advance();
            cmd = Cmd::Back(Box::new(cmd));
        }

        if let Some(Token::Semi) = self.peek() {
            if cmd.is_empty_exec() {
                return Err(ShellError::Syntax(
                    "no se encontró comando antes de ';'".to_string(),
                ));
            }
            self.advance();
            cmd = Cmd::List {
                left: Box::new(cmd),
                right: Box::new(self.parse_line()?),
            };
        }

        Ok(cmd)
    }

    fn parse_pipe(&mut self) -> Result<Cmd, ShellError> {
        let cmd = self.parse_exec()?;

        if let Some(Token::Pipe) = self.peek() {
            if cmd.is_empty_exec() {
                return Err(ShellError::Syntax(
                    "no se encontró comando antes de '|'".to_string(),
                ));
            }
            self.advance();
            return Ok(Cmd::Pipe {
                left: Box::new(cmd),
                right: Box::new(self.parse_pipe()?),
            });
        }

        Ok(cmd)
    }

    fn parse_exec(&mut self) -> Result<Cmd, ShellError> {
        if let Some(Token::LeftParen) = self.peek() {
            return self.parse_subs();
        }

        let mut argv: Vec<String> = vec![];
        let mut redirs = vec![];

        // Redirections may appear before the command word
        self.parse_redrs(&mut redirs)?;

        loop {
            match self.peek() {
                Some(Token::Word(_)) => {
                    let Some(Token::Word(word)) = self.advance() else {
                        unreachable!();
                    };
                    argv.push(word);
                    // The terminator slot stays reserved
                    if argv.len() >= MAX_ARGS {
                        return Err(ShellError::TooManyArgs);
                    }
                    self.parse_redrs(&mut redirs)?;
                }
                None
                | Some(Token::Pipe)
                | Some(Token::Amp)
                | Some(Token::Semi)
                | Some(Token::RightParen) => break,
                Some(token) => {
                    return Err(ShellError::Syntax(format!(
                        "se esperaba un argumento, se encontró '{}'",
                        token
                    )));
                }
            }
        }

        Ok(wrap_redirs(Cmd::Exec(ExecCmd { argv }), redirs))
    }

    fn parse_subs(&mut self) -> Result<Cmd, ShellError> {
        // Opening parenthesis already seen by the caller
        self.advance();

        let cmd = self.parse_line()?;

        match self.advance() {
            Some(Token::RightParen) => {}
            _ => {
                return Err(ShellError::Syntax("se esperaba ')'".to_string()));
            }
        }

        let mut redirs = vec![];
        self.parse_redrs(&mut redirs)?;

        Ok(wrap_redirs(Cmd::Subs(Box::new(cmd)), redirs))
    }

    // Collects consecutive redirections into (file, flags, fd) triples; they
    // are folded around the command node once its argv is complete.
    fn parse_redrs(&mut self, redirs: &mut Vec<(String, OFlag, i32)>) -> Result<(), ShellError> {
        loop {
            let (flags, fd) = match self.peek() {
                Some(Token::Less) => (OFlag::O_RDONLY, libc::STDIN_FILENO),
                Some(Token::Great) => (
                    OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
                    libc::STDOUT_FILENO,
                ),
                Some(Token::Append) => (
                    OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
                    libc::STDOUT_FILENO,
                ),
                _ => return Ok(()),
            };
            self.advance();

            match self.advance() {
                Some(Token::Word(file)) => redirs.push((file, flags, fd)),
                _ => {
                    return Err(ShellError::Syntax(
                        "se esperaba un fichero tras la redirección".to_string(),
                    ));
                }
            }
        }
    }
}

// First redirection encountered ends up innermost, as with repeated wrapping.
fn wrap_redirs(cmd: Cmd, redirs: Vec<(String, OFlag, i32)>) -> Cmd {
    redirs.into_iter().fold(cmd, |cmd, (file, flags, fd)| {
        Cmd::Redr(RedrCmd {
            cmd: Box::new(cmd),
            file,
            flags,
            mode: Mode::S_IRWXU,
            fd,
        })
    })
}
