//! CoRE link format (RFC 6690), used by Discover responses and
//! registration bodies.

use crate::Error;

/// One `<target>;param=value;...` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub target: String,
    pub params: Vec<(String, String)>,
}

impl Link {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl ToString) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }
}

/// Serialize entries: `</>;rt="oma.lwm2m",</3/0>,</4/0>`.
///
/// # Test
///
/// ```
/// use lwm2m_stack_codec::link::{Link, serialise};
///
/// let links = [
///     Link::new("/").with_param("rt", "\"oma.lwm2m\""),
///     Link::new("/3/0"),
/// ];
///
/// assert_eq!(serialise(&links), "</>;rt=\"oma.lwm2m\",</3/0>");
/// ```
pub fn serialise(links: &[Link]) -> String {
    links
        .iter()
        .map(|link| {
            let mut out = format!("<{}>", link.target);
            for (name, value) in &link.params {
                out.push(';');
                out.push_str(name);
                out.push('=');
                out.push_str(value);
            }

            out
        })
        .collect::<Vec<String>>()
        .join(",")
}

/// Parse a link-format body.
///
/// Tolerates whitespace between entries; rejects entries missing the
/// `<target>` bracketing.
pub fn parse(body: &str) -> Result<Vec<Link>, Error> {
    let mut links = Vec::new();

    for entry in body.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let rest = entry.strip_prefix('<').ok_or(Error::DecodeError)?;
        let (target, rest) = rest.split_once('>').ok_or(Error::DecodeError)?;

        let mut link = Link::new(target);
        for param in rest.split(';').skip(1) {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }

            match param.split_once('=') {
                Some((name, value)) => {
                    link.params.push((name.to_string(), value.to_string()));
                }
                None => link.params.push((param.to_string(), String::new())),
            }
        }

        links.push(link);
    }

    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let body = "</>;rt=\"oma.lwm2m\",</1/0>,</3/0>,</9999>";
        let links = parse(body).unwrap();

        assert_eq!(links.len(), 4);
        assert_eq!(links[0].target, "/");
        assert_eq!(links[0].params[0].0, "rt");
        assert_eq!(serialise(&links), body);
    }

    #[test]
    fn whitespace_tolerated() {
        let links = parse("</1/0>, </3/0>").unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[1].target, "/3/0");
    }

    #[test]
    fn missing_brackets_rejected() {
        assert!(parse("/3/0").is_err());
    }
}
