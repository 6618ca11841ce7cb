use std::{borrow::Cow, collections::BTreeMap};

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};

const IMG_OPEN: &str = "<img>";
const IMG_CLOSE: &str = "</img>";
const HW_OPEN: &str = "<hw>";
const HW_CLOSE: &str = "</hw>";

/// Explicit target geometry for one image, parsed from `<hw>H,W</hw>` or supplied with an
/// [`ImagePart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeHint {
    pub height: u32,
    pub width: u32,
}

impl SizeHint {
    pub fn new(height: u32, width: u32) -> Option<Self> {
        (height > 0 && width > 0).then_some(Self { height, width })
    }

    pub fn square(edge: u32) -> Self {
        Self {
            height: edge.max(1),
            width: edge.max(1),
        }
    }

    /// Scales the hint down, keeping its aspect ratio, so neither side exceeds `max_edge`.
    pub fn clamp_to(self, max_edge: u32) -> Self {
        let max_edge = max_edge.max(1);
        let longest = self.height.max(self.width);
        if longest <= max_edge {
            return self;
        }
        let scale = |side: u32| {
            let scaled = u64::from(side) * u64::from(max_edge) / u64::from(longest);
            (scaled as u32).max(1)
        };
        Self {
            height: scale(self.height),
            width: scale(self.width),
        }
    }

    /// Parses `"H,W"`; anything other than two positive integers yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (h, w) = raw.split_once(',')?;
        let height = h.trim().parse::<u32>().ok()?;
        let width = w.trim().parse::<u32>().ok()?;
        Self::new(height, width)
    }
}

/// An image embedded in the prompt request under a part name.
#[derive(Debug, Clone)]
pub struct ImagePart {
    pub image: DynamicImage,
    pub size_hint: Option<SizeHint>,
}

impl ImagePart {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image,
            size_hint: None,
        }
    }

    /// Decodes an encoded image (PNG, JPEG, ...).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("failed to decode image part")?;
        Ok(Self::new(image))
    }

    pub fn with_size_hint(mut self, height: u32, width: u32) -> Self {
        self.size_hint = SizeHint::new(height, width);
        self
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// A prompt template with inline `<img>` tags and the image parts they may reference.
#[derive(Debug, Clone, Default)]
pub struct MultimodalPrompt {
    pub template: String,
    pub images: BTreeMap<String, ImagePart>,
}

impl MultimodalPrompt {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            images: BTreeMap::new(),
        }
    }

    pub fn with_image(mut self, name: impl Into<String>, part: ImagePart) -> Self {
        self.images.insert(name.into(), part);
        self
    }

    pub fn spans(&self) -> Vec<Span<'_>> {
        parse_prompt(&self.template)
    }
}

impl From<&str> for MultimodalPrompt {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MultimodalPrompt {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Span<'a> {
    Text(&'a str),
    Image {
        content: Cow<'a, str>,
        size_hint: Option<SizeHint>,
    },
}

/// Splits a template into literal text and image spans in document order.
///
/// An `<img>` tag is closed by the first `</img>` after it. Tags whose content crosses a
/// line break, and tags that are never closed, stay literal text. Empty text spans are not
/// emitted.
pub fn parse_prompt(template: &str) -> Vec<Span<'_>> {
    let mut spans = Vec::new();
    let mut text_start = 0usize;
    let mut cursor = 0usize;
    while let Some(rel) = template[cursor..].find(IMG_OPEN) {
        let open = cursor + rel;
        let body_start = open + IMG_OPEN.len();
        // A tag never spans a line break, so the close is only searched up to the line end.
        let line_end = template[body_start..]
            .find(['\n', '\r'])
            .map(|rel| body_start + rel);
        let line = &template[body_start..line_end.unwrap_or(template.len())];
        let Some(close_rel) = line.find(IMG_CLOSE) else {
            match line_end {
                Some(end) => {
                    cursor = end + 1;
                    continue;
                }
                None => break,
            }
        };
        let body_end = body_start + close_rel;
        let body = &template[body_start..body_end];

        let (text, outer_hint) = strip_trailing_hint(&template[text_start..open]);
        if !text.is_empty() {
            spans.push(Span::Text(text));
        }
        let (content, inner_hint) = extract_hint(body);
        spans.push(Span::Image {
            content,
            size_hint: inner_hint.or(outer_hint),
        });
        cursor = body_end + IMG_CLOSE.len();
        text_start = cursor;
    }
    if text_start < template.len() {
        spans.push(Span::Text(&template[text_start..]));
    }
    spans
}

/// Removes a `<hw>H,W</hw>` that ends `text` (the hint written just before an `<img>`).
fn strip_trailing_hint(text: &str) -> (&str, Option<SizeHint>) {
    if !text.ends_with(HW_CLOSE) {
        return (text, None);
    }
    let inner_end = text.len() - HW_CLOSE.len();
    match text[..inner_end].rfind(HW_OPEN) {
        Some(open) => {
            let hint = SizeHint::parse(&text[open + HW_OPEN.len()..inner_end]);
            (&text[..open], hint)
        }
        None => (text, None),
    }
}

/// Removes the first `<hw>H,W</hw>` inside an image tag body.
fn extract_hint(body: &str) -> (Cow<'_, str>, Option<SizeHint>) {
    let Some(open) = body.find(HW_OPEN) else {
        return (Cow::Borrowed(body), None);
    };
    let inner_start = open + HW_OPEN.len();
    let Some(close_rel) = body[inner_start..].find(HW_CLOSE) else {
        return (Cow::Borrowed(body), None);
    };
    let inner_end = inner_start + close_rel;
    let hint = SizeHint::parse(&body[inner_start..inner_end]);
    let prefix = &body[..open];
    let suffix = &body[inner_end + HW_CLOSE.len()..];
    let content = match (prefix.is_empty(), suffix.is_empty()) {
        (true, _) => Cow::Borrowed(suffix),
        (false, true) => Cow::Borrowed(prefix),
        (false, false) => Cow::Owned(format!("{prefix}{suffix}")),
    };
    (content, hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(content: &str, size_hint: Option<SizeHint>) -> Span<'_> {
        Span::Image {
            content: Cow::Borrowed(content),
            size_hint,
        }
    }

    #[test]
    fn plain_text_is_one_span() {
        assert_eq!(
            parse_prompt("describe nothing"),
            vec![Span::Text("describe nothing")]
        );
        assert!(parse_prompt("").is_empty());
    }

    #[test]
    fn image_tags_split_text_in_order() {
        let spans = parse_prompt("a<img>cat</img>b<img>dog.png</img>");
        assert_eq!(
            spans,
            vec![
                Span::Text("a"),
                image("cat", None),
                Span::Text("b"),
                image("dog.png", None),
            ]
        );
    }

    #[test]
    fn hint_inside_tag_is_removed_from_content() {
        let spans = parse_prompt("<img><hw>280,420</hw>https://host/a.jpg</img>done");
        assert_eq!(
            spans,
            vec![
                image("https://host/a.jpg", SizeHint::new(280, 420)),
                Span::Text("done"),
            ]
        );
    }

    #[test]
    fn hint_before_tag_is_removed_from_text() {
        let spans = parse_prompt("look <hw>10,20</hw><img>x</img>");
        assert_eq!(
            spans,
            vec![Span::Text("look "), image("x", SizeHint::new(10, 20))]
        );
    }

    #[test]
    fn malformed_hint_is_dropped() {
        let spans = parse_prompt("<img>a<hw>tall</hw>b</img>");
        assert_eq!(spans, vec![image("ab", None)]);
    }

    #[test]
    fn unterminated_tag_is_literal() {
        let spans = parse_prompt("before <img>never closed");
        assert_eq!(spans, vec![Span::Text("before <img>never closed")]);
    }

    #[test]
    fn nested_open_tag_closes_at_first_close() {
        let spans = parse_prompt("<img>a<img>b</img>c</img>");
        assert_eq!(spans, vec![image("a<img>b", None), Span::Text("c</img>")]);
    }

    #[test]
    fn tag_across_line_break_is_literal() {
        let spans = parse_prompt("<img>a\nb</img> then <img>c</img>");
        assert_eq!(
            spans,
            vec![Span::Text("<img>a\nb</img> then "), image("c", None)]
        );
    }

    #[test]
    fn many_broken_tags_before_a_distant_close_stay_linear() {
        let mut template = "<img>x\n".repeat(50_000);
        template.push_str("</img><img>y</img>");
        let start = std::time::Instant::now();
        let spans = parse_prompt(&template);
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0], Span::Text(&template[..template.len() - 12]));
        assert_eq!(spans[1], image("y", None));
    }

    #[test]
    fn size_hint_parsing() {
        assert_eq!(SizeHint::parse(" 12 , 34 "), SizeHint::new(12, 34));
        assert_eq!(SizeHint::parse("0,34"), None);
        assert_eq!(SizeHint::parse("12"), None);
        assert_eq!(SizeHint::parse("a,b"), None);
    }

    #[test]
    fn oversized_hint_is_clamped_keeping_aspect() {
        let hint = SizeHint::parse("4294967295,1").expect("hint");
        assert_eq!(hint.clamp_to(2048), SizeHint { height: 2048, width: 1 });
        let hint = SizeHint { height: 4000, width: 1000 };
        assert_eq!(hint.clamp_to(2048), SizeHint { height: 2048, width: 512 });
        assert_eq!(hint.clamp_to(0), SizeHint { height: 1, width: 1 });
        assert_eq!(SizeHint::square(448).clamp_to(2048), SizeHint::square(448));
    }
}
