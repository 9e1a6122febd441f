use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    Less,      // "<"
    Great,     // ">"
    Append,    // ">>"
    Pipe,      // "|"
    Amp,       // "&"
    Semi,      // ";"
    LeftParen, // "("
    RightParen, // ")"
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant_str = match self {
            Token::Word(word) => word.as_str(),
            Token::Less => "<",
            Token::Great => ">",
            Token::Append => ">>",
            Token::Pipe => "|",
            Token::Amp => "&",
            Token::Semi => ";",
            Token::LeftParen => "(",
            Token::RightParen => ")",
        };

        write!(f, "{}", variant_str)
    }
}
