use super::{BinaryName, Name};
use crate::util::Width;
use std::io::{Error, ErrorKind, Result};
use std::iter::Peekable;
use std::str::Chars;

/// Descriptors that can be read back from their string form
pub trait ParseDescriptor: Sized {
    /// Parse a whole descriptor, rejecting trailing input
    fn parse(source: &str) -> Result<Self> {
        let mut chars = source.chars().peekable();
        let parsed = Self::parse_from(&mut chars)?;
        match chars.next() {
            None => Ok(parsed),
            Some(c) => Err(invalid(format!("Unexpected leftover input '{}'", c))),
        }
    }

    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self>;
}

fn invalid(msg: String) -> Error {
    Error::new(ErrorKind::InvalidInput, msg)
}

fn eof(msg: &str) -> Error {
    Error::new(ErrorKind::UnexpectedEof, msg)
}

/// Primitive value types
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

impl BaseType {
    fn from_char(c: char) -> Option<BaseType> {
        Some(match c {
            'B' => BaseType::Byte,
            'C' => BaseType::Char,
            'D' => BaseType::Double,
            'F' => BaseType::Float,
            'I' => BaseType::Int,
            'J' => BaseType::Long,
            'S' => BaseType::Short,
            'Z' => BaseType::Boolean,
            _ => return None,
        })
    }
}

impl Width for BaseType {
    fn width(&self) -> usize {
        match self {
            BaseType::Double | BaseType::Long => 2,
            _ => 1,
        }
    }
}

/// Type of a field, parameter, or local variable
///
/// Arrays only keep what patching needs: their dimension count and whether the element is an
/// object.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum FieldType {
    Base(BaseType),
    Object(BinaryName),
    Array { dimensions: usize, element: Box<FieldType> },
}

impl Width for FieldType {
    fn width(&self) -> usize {
        match self {
            FieldType::Base(base_type) => base_type.width(),
            FieldType::Object(_) | FieldType::Array { .. } => 1,
        }
    }
}

fn parse_class_name(source: &mut Peekable<Chars>) -> Result<BinaryName> {
    let mut class_name = String::new();
    loop {
        match source.next() {
            Some(';') => return BinaryName::from_string(class_name).map_err(invalid),
            Some(c) => class_name.push(c),
            None => return Err(eof("Unterminated object type")),
        }
    }
}

impl ParseDescriptor for FieldType {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        match source.next() {
            Some('L') => parse_class_name(source).map(FieldType::Object),
            Some('[') => {
                let mut dimensions = 1;
                while source.next_if_eq(&'[').is_some() {
                    dimensions += 1;
                }
                let element = Box::new(FieldType::parse_from(source)?);
                Ok(FieldType::Array {
                    dimensions,
                    element,
                })
            }
            Some(c) => BaseType::from_char(c)
                .map(FieldType::Base)
                .ok_or_else(|| invalid(format!("Invalid field type character '{}'", c))),
            None => Err(eof("Missing field type")),
        }
    }
}

/// Signature of a method
#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,

    /// `None` for `void`
    pub return_type: Option<FieldType>,
}

impl MethodDescriptor {
    /// Local variable slots taken by the parameters, plus one for a receiver
    pub fn parameter_length(&self, has_this_param: bool) -> usize {
        let receiver = usize::from(has_this_param);
        receiver + self.parameters.iter().map(Width::width).sum::<usize>()
    }

    /// Number of stack slots taken up by the return value
    pub fn return_width(&self) -> usize {
        self.return_type.as_ref().map_or(0, Width::width)
    }
}

impl ParseDescriptor for MethodDescriptor {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        if source.next_if_eq(&'(').is_none() {
            return Err(invalid(String::from("Expected '(' for method")));
        }

        let mut parameters = vec![];
        loop {
            match source.peek() {
                Some(')') => break,
                None => return Err(eof("Expected ')' for method")),
                Some(_) => parameters.push(FieldType::parse_from(source)?),
            }
        }
        source.next();

        let return_type = if source.next_if_eq(&'V').is_some() {
            None
        } else {
            Some(FieldType::parse_from(source)?)
        };

        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }
}

pub type JavaFieldType = FieldType;
pub type JavaMethodDescriptor = MethodDescriptor;

/// Stack width of a raw field descriptor string
pub fn field_width(descriptor: &str) -> Result<usize> {
    JavaFieldType::parse(descriptor).map(|typ| typ.width())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_types() {
        assert_eq!(JavaFieldType::parse("I").unwrap(), FieldType::Base(BaseType::Int));
        assert_eq!(
            JavaFieldType::parse("Ljava/lang/Object;").unwrap(),
            FieldType::Object(BinaryName::OBJECT)
        );
        assert_eq!(
            JavaFieldType::parse("[[D").unwrap(),
            FieldType::Array {
                dimensions: 2,
                element: Box::new(FieldType::Base(BaseType::Double)),
            }
        );
        assert_eq!(field_width("[Ljava/lang/String;").unwrap(), 1);
        assert_eq!(field_width("J").unwrap(), 2);
    }

    #[test]
    fn method_widths() {
        let desc = JavaMethodDescriptor::parse("(IJLjava/lang/String;[D)J").unwrap();
        assert_eq!(desc.parameter_length(false), 5);
        assert_eq!(desc.parameter_length(true), 6);
        assert_eq!(desc.return_width(), 2);

        let void = JavaMethodDescriptor::parse("()V").unwrap();
        assert_eq!(void.parameter_length(false), 0);
        assert_eq!(void.return_width(), 0);
    }

    #[test]
    fn malformed() {
        assert!(JavaMethodDescriptor::parse("(I").is_err());
        assert!(JavaFieldType::parse("Ljava/lang/Object").is_err());
        assert!(JavaFieldType::parse("II").is_err());
        assert!(JavaFieldType::parse("V").is_err());
    }
}
