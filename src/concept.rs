//! Concept ingestion: turning the request's product description (inline text
//! or a product page) into the stimulus block shown to personas.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_FETCHED_BLOCKS: usize = 20;
const MAX_DESCRIPTION_CHARS: usize = 2000;

static TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("Invalid title regex"));
static TEXT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:p|li)(?:\s[^>]*)?>(.*?)</(?:p|li)>").expect("Invalid text block regex")
});
static NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(?:script|style)>").expect("Invalid noise regex")
});
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

#[derive(Debug, Error)]
pub enum ConceptError {
    #[error("concept description could not be determined")]
    MissingDescription,

    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConceptInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
}

impl ConceptInput {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_price(mut self, price: impl Into<String>) -> Self {
        self.price = Some(price.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConceptArtifact {
    pub title: Option<String>,
    pub description: String,
    pub price: Option<String>,
    pub url: Option<String>,
}

impl ConceptArtifact {
    pub fn as_prompt_block(&self) -> String {
        let mut parts = Vec::with_capacity(4);
        if let Some(title) = &self.title {
            parts.push(format!("Product: {title}"));
        }
        if let Some(price) = &self.price {
            parts.push(format!("Price: {price}"));
        }
        parts.push(self.description.trim().to_string());
        if let Some(url) = &self.url {
            parts.push(format!("Source: {url}"));
        }
        parts.join("\n")
    }
}

fn collapse_ws(input: &str) -> String {
    WHITESPACE.replace_all(input, " ").trim().to_string()
}

fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Page title and the first paragraph/list-item texts of an HTML document.
pub fn extract_page_text(html: &str) -> (Option<String>, String) {
    let html = NOISE.replace_all(html, " ");
    let title = TITLE
        .captures(&html)
        .map(|c| collapse_ws(&strip_tags(&c[1])))
        .filter(|t| !t.is_empty());

    let blocks: Vec<String> = TEXT_BLOCK
        .captures_iter(&html)
        .take(MAX_FETCHED_BLOCKS)
        .map(|c| collapse_ws(&strip_tags(&c[1])))
        .filter(|t| !t.is_empty())
        .collect();
    let description: String = collapse_ws(&blocks.join(" "))
        .chars()
        .take(MAX_DESCRIPTION_CHARS)
        .collect();
    (title, description)
}

pub async fn fetch_url_text(
    client: &reqwest::Client,
    url: &str,
) -> Result<(Option<String>, String), ConceptError> {
    let fetch_err = |source| ConceptError::Fetch {
        url: url.to_string(),
        source,
    };
    let body = client
        .get(url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(fetch_err)?
        .text()
        .await
        .map_err(fetch_err)?;
    Ok(extract_page_text(&body))
}

/// Resolves a concept into a prompt-ready artifact. The page at `url` is
/// fetched only when no inline text is given; an explicit title wins over
/// the page title.
pub async fn ingest_concept(
    client: &reqwest::Client,
    concept: &ConceptInput,
) -> Result<ConceptArtifact, ConceptError> {
    let mut title = concept.title.clone().filter(|t| !t.trim().is_empty());
    let mut description = concept.text.clone().unwrap_or_default();

    if description.trim().is_empty() {
        if let Some(url) = &concept.url {
            let (fetched_title, fetched) = fetch_url_text(client, url).await?;
            tracing::debug!(url = %url, chars = fetched.len(), "fetched concept page");
            title = title.or(fetched_title);
            description = fetched;
        }
    }

    if description.trim().is_empty() {
        return Err(ConceptError::MissingDescription);
    }

    Ok(ConceptArtifact {
        title,
        description,
        price: concept.price.clone(),
        url: concept.url.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn prompt_block_layout() {
        let artifact = ConceptArtifact {
            title: Some("Mint Paste".into()),
            description: "  Fresh breath all day. ".into(),
            price: Some("$4.99".into()),
            url: Some("https://example.com/p".into()),
        };
        assert_eq!(
            artifact.as_prompt_block(),
            "Product: Mint Paste\nPrice: $4.99\nFresh breath all day.\nSource: https://example.com/p"
        );
    }

    #[test]
    fn page_text_extraction() {
        let html = r#"<html><head><title> Mint &amp; Co </title>
            <script>var p = "<p>not this</p>";</script></head>
            <body><p class="lead">Fresh <b>breath</b>
            all day.</p><ul><li>Fluoride</li><li></li></ul></body></html>"#;
        let (title, text) = extract_page_text(html);
        assert_eq!(title.as_deref(), Some("Mint & Co"));
        assert_eq!(text, "Fresh breath all day. Fluoride");
    }

    #[tokio::test]
    async fn inline_text_skips_fetch() {
        let client = reqwest::Client::new();
        let concept = ConceptInput {
            url: Some("http://127.0.0.1:9/unreachable".into()),
            ..ConceptInput::from_text("A refillable toothpaste tablet.")
        };
        let artifact = ingest_concept(&client, &concept).await.unwrap();
        assert_eq!(artifact.description, "A refillable toothpaste tablet.");
        assert_eq!(artifact.url.as_deref(), Some("http://127.0.0.1:9/unreachable"));
    }

    #[tokio::test]
    async fn fetches_page_when_text_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/product"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<title>Tabs</title><p>Chewable toothpaste tablets.</p>",
            ))
            .mount(&server)
            .await;

        let concept = ConceptInput {
            url: Some(format!("{}/product", server.uri())),
            ..Default::default()
        };
        let artifact = ingest_concept(&reqwest::Client::new(), &concept)
            .await
            .unwrap();
        assert_eq!(artifact.title.as_deref(), Some("Tabs"));
        assert_eq!(artifact.description, "Chewable toothpaste tablets.");
    }

    #[tokio::test]
    async fn missing_description_is_an_error() {
        let err = ingest_concept(&reqwest::Client::new(), &ConceptInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConceptError::MissingDescription));
    }
}
