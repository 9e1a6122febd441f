use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("simplesh: error sintáctico: {0}")]
    Syntax(String),
    #[error("simplesh: demasiados argumentos")]
    TooManyArgs,
}
