//! Notification message template.
//!
//! Templates are plain text with `{{field}}` placeholders. They are parsed
//! once when configuration is loaded, so rendering cannot fail.

use crate::types::ReleaseInfo;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder '{{{{{0}}}}}'")]
    UnknownPlaceholder(String),
    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Repository,
    Owner,
    Name,
    Tag,
    Title,
    PublishedAt,
    Description,
    Url,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "repository" => Field::Repository,
            "owner" => Field::Owner,
            "name" => Field::Name,
            "tag" => Field::Tag,
            "title" => Field::Title,
            "published_at" => Field::PublishedAt,
            "description" => Field::Description,
            "url" => Field::Url,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or(TemplateError::Unclosed(offset + start))?;
            let name = after[..end].trim();
            let field = Field::parse(name).ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
            segments.push(Segment::Field(field));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn render(&self, release: &ReleaseInfo) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => match field {
                    Field::Repository => out.push_str(&release.identity.to_string()),
                    Field::Owner => out.push_str(&release.identity.owner),
                    Field::Name => out.push_str(&release.identity.name),
                    Field::Tag => out.push_str(&release.tag_name),
                    Field::Title => out.push_str(&release.display_name),
                    Field::PublishedAt => {
                        out.push_str(&release.published_at.format("%Y-%m-%d %H:%M:%S").to_string())
                    }
                    Field::Description => out.push_str(release.description.as_deref().unwrap_or("")),
                    Field::Url => out.push_str(&release.url),
                },
            }
        }
        out
    }
}

impl Default for Template {
    fn default() -> Self {
        // The built-in template only uses known placeholders
        Self::parse(crate::constants::DEFAULT_TEMPLATE).unwrap_or(Self { segments: Vec::new() })
    }
}
