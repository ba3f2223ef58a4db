pub mod from_yaml;
pub mod lexer;

pub use from_yaml::*;

use std::collections::BTreeMap;
use std::fmt;

use crate::lexer::{LexerError, Token, Tokenizer};

#[derive(Debug)]
pub enum YamlError {
    Lex(String),
    Parse(String),
    Generic(String),
}

impl fmt::Display for YamlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            YamlError::Lex(s) => write!(f, "lex error: {s}"),
            YamlError::Parse(s) => write!(f, "parse error: {s}"),
            YamlError::Generic(s) => write!(f, "{s}"),
        }
    }
}

impl std::error::Error for YamlError {}

impl From<LexerError> for YamlError {
    fn from(e: LexerError) -> Self {
        YamlError::Lex(e.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum YamlValue<'a> {
    Map(BTreeMap<&'a str, YamlValue<'a>>),
    List(Vec<YamlValue<'a>>),
    Scalar(&'a str),
}

impl<'a> YamlValue<'a> {
    pub fn get(&self, key: &str) -> Option<&YamlValue<'a>> {
        if let YamlValue::Map(m) = self {
            m.get(key)
        } else {
            None
        }
    }

    pub fn index(&self, i: usize) -> Option<&YamlValue<'a>> {
        if let YamlValue::List(l) = self {
            l.get(i)
        } else {
            None
        }
    }

    pub fn as_scalar(&self) -> Option<&'a str> {
        if let YamlValue::Scalar(s) = self {
            Some(s)
        } else {
            None
        }
    }
}

pub struct Parser<'a> {
    pub tokenizer: Tokenizer<'a>,
    pub lookahead: Token<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Result<Self, YamlError> {
        let mut tokenizer = Tokenizer::new(source);
        let first = tokenizer.next_token()?;
        Ok(Self {
            tokenizer,
            lookahead: first,
        })
    }

    fn advance(&mut self) -> Result<(), YamlError> {
        self.lookahead = self.tokenizer.next_token()?;
        Ok(())
    }

    fn skip_junk(&mut self) -> Result<(), YamlError> {
        while let Token::NewLine = self.lookahead {
            self.advance()?;
        }
        Ok(())
    }

    pub fn parse(&mut self) -> Result<YamlValue<'a>, YamlError> {
        self.skip_junk()?;

        if let Token::Indent(n) = self.lookahead {
            let start_indent = n;
            self.advance()?;
            self.parse_value(start_indent)
        } else {
            self.parse_value(0)
        }
    }

    pub fn parse_value(&mut self, current_indent: usize) -> Result<YamlValue<'a>, YamlError> {
        self.skip_junk()?;

        match self.lookahead {
            Token::Indent(n) => {
                // A deeper indent opens a nested block; a dedent or sibling
                // is left for the caller (parent map/list) to observe.
                if n > current_indent {
                    self.advance()?;
                    if matches!(self.lookahead, Token::Dash) {
                        return self.parse_list(n, current_indent);
                    }
                    return self.parse_value(n);
                }
                Ok(YamlValue::Scalar(""))
            }
            Token::Dash => self.parse_list(current_indent, current_indent),
            Token::OpenBracket => self.parse_bracket_list(),
            Token::OpenBrace => self.parse_brace_map(),
            Token::Identifier(s) => {
                self.advance()?;
                if matches!(self.lookahead, Token::Colon) {
                    self.parse_map(s, current_indent)
                } else {
                    Ok(YamlValue::Scalar(s))
                }
            }
            Token::Scalar(s) => {
                self.advance()?;
                Ok(YamlValue::Scalar(s))
            }
            _ => Err(YamlError::Parse(format!(
                "expected value, found {:?}",
                self.lookahead
            ))),
        }
    }

    pub fn parse_list(
        &mut self,
        list_indent: usize,
        parent_indent: usize,
    ) -> Result<YamlValue<'a>, YamlError> {
        let mut items = Vec::new();

        loop {
            if !matches!(self.lookahead, Token::Dash) {
                break;
            }
            self.advance()?; // consume '-'
            items.push(self.parse_value(list_indent + 2)?);
            self.skip_junk()?;

            if let Token::Indent(n) = self.lookahead {
                if n == list_indent {
                    self.advance()?;
                    if matches!(self.lookahead, Token::Dash) {
                        continue;
                    } else {
                        return Err(YamlError::Parse(format!(
                            "expected '-' for list item, found {:?}",
                            self.lookahead
                        )));
                    }
                } else if n <= parent_indent {
                    break;
                } else {
                    return Err(YamlError::Parse(format!(
                        "sequence items must align at column {}, found {}",
                        list_indent, n
                    )));
                }
            } else if !matches!(self.lookahead, Token::Dash) {
                break;
            }
        }
        Ok(YamlValue::List(items))
    }

    pub fn parse_bracket_list(&mut self) -> Result<YamlValue<'a>, YamlError> {
        self.advance()?; // consume '['

        let mut items = Vec::new();
        while !matches!(self.lookahead, Token::CloseBracket) && !matches!(self.lookahead, Token::Eof)
        {
            if matches!(self.lookahead, Token::Indent(_)) || matches!(self.lookahead, Token::NewLine) {
                self.advance()?;
                continue;
            }

            items.push(self.parse_value(0)?);

            if matches!(self.lookahead, Token::Comma) {
                self.advance()?;
                while matches!(self.lookahead, Token::Indent(_)) || matches!(self.lookahead, Token::NewLine) {
                    self.advance()?;
                }
            }
        }

        if !matches!(self.lookahead, Token::CloseBracket) {
            return Err(YamlError::Parse("expected closing bracket ']'".into()));
        }
        self.advance()?;
        Ok(YamlValue::List(items))
    }

    pub fn parse_brace_map(&mut self) -> Result<YamlValue<'a>, YamlError> {
        self.advance()?; // consume '{'
        let mut map = BTreeMap::new();
        while !matches!(self.lookahead, Token::CloseBrace) && !matches!(self.lookahead, Token::Eof) {
            if matches!(self.lookahead, Token::Indent(_)) || matches!(self.lookahead, Token::NewLine) {
                self.advance()?;
                continue;
            }

            let key = match self.lookahead {
                Token::Identifier(s) => {
                    self.advance()?;
                    s
                }
                _ => return Err(YamlError::Parse("expected identifier".into())),
            };

            if !matches!(self.lookahead, Token::Colon) {
                return Err(YamlError::Parse("expected ':'".into()));
            }
            self.advance()?;

            let value = self.parse_value(0)?;
            map.insert(key, value);

            if matches!(self.lookahead, Token::Comma) {
                self.advance()?;
                while matches!(self.lookahead, Token::Indent(_)) || matches!(self.lookahead, Token::NewLine) {
                    self.advance()?;
                }
            }
        }

        if !matches!(self.lookahead, Token::CloseBrace) {
            return Err(YamlError::Parse("expected closing brace '}'".into()));
        }
        self.advance()?;
        Ok(YamlValue::Map(map))
    }

    pub fn parse_map(
        &mut self,
        first_key: &'a str,
        map_indent: usize,
    ) -> Result<YamlValue<'a>, YamlError> {
        let mut map = BTreeMap::new();
        let mut current_key = first_key;

        loop {
            if !matches!(self.lookahead, Token::Colon) {
                return Err(YamlError::Parse(format!(
                    "expected ':' after '{}', found {:?}",
                    current_key, self.lookahead
                )));
            }
            self.advance()?;
            self.skip_junk()?;

            let value = self.parse_value(map_indent)?;
            if map.insert(current_key, value).is_some() {
                return Err(YamlError::Parse(format!("duplicate key: {}", current_key)));
            }

            self.skip_junk()?;

            if let Token::Indent(n) = self.lookahead {
                if n == map_indent {
                    self.advance()?;
                    match self.lookahead {
                        Token::Identifier(s) => {
                            current_key = s;
                            self.advance()?;
                            continue;
                        }
                        _ => {
                            return Err(YamlError::Parse(format!(
                                "expected identifier for map key, found {:?}",
                                self.lookahead
                            )));
                        }
                    }
                } else if n > map_indent {
                    return Err(YamlError::Parse(format!(
                        "map keys must align at column {}, found {}",
                        map_indent, n
                    )));
                } else {
                    break;
                }
            }
            break;
        }
        Ok(YamlValue::Map(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_map() {
        let src = "host: 127.0.0.1\nport: 8080\n";
        let mut parser = Parser::new(src).unwrap();
        let value = parser.parse().unwrap();
        assert_eq!(value.get("host").unwrap().as_scalar(), Some("127.0.0.1"));
        assert_eq!(value.get("port").unwrap().as_scalar(), Some("8080"));
    }

    #[test]
    fn parses_nested_block_and_list() {
        let src = "server:\n  listen: 8080\n  routes:\n    - /a\n    - /b\n";
        let mut parser = Parser::new(src).unwrap();
        let value = parser.parse().unwrap();
        let server = value.get("server").unwrap();
        assert_eq!(server.get("listen").unwrap().as_scalar(), Some("8080"));
        let routes = server.get("routes").unwrap();
        assert_eq!(routes.index(0).unwrap().as_scalar(), Some("/a"));
        assert_eq!(routes.index(1).unwrap().as_scalar(), Some("/b"));
    }

    #[test]
    fn parses_inline_brace_map_and_bracket_list() {
        let src = "limits: {max: 10, min: 1}\ntags: [a, b, c]\n";
        let mut parser = Parser::new(src).unwrap();
        let value = parser.parse().unwrap();
        let limits = value.get("limits").unwrap();
        assert_eq!(limits.get("max").unwrap().as_scalar(), Some("10"));
        let tags = value.get("tags").unwrap();
        assert_eq!(tags.index(2).unwrap().as_scalar(), Some("c"));
    }

    #[test]
    fn rejects_misaligned_map_keys() {
        let src = "a: 1\n   b: 2\n";
        let mut parser = Parser::new(src).unwrap();
        assert!(parser.parse().is_err());
    }
}
