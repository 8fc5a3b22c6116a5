use std::sync::OnceLock;

use elh_core::{append_unique, CollectionKey, Record, WorkItemRef};
use regex::Regex;
use scraper::Html;
use url::Url;

use crate::{
    select_all_attrs, select_all_texts, select_first_text, selector, AdapterError, RenderedTitle,
    SiteAdapter, TitlePage,
};

const LISTING_LINK: &str = r#"a.link-hover.link-pri.line-clamp-2[href^="/title/"]"#;
const COVER_IMAGE: &str = "img.w-full.not-prose";
const RENDERED_COVER_IMAGE: &str = "img[alt][src][title]";
const RENDERED_EPISODE_LINK: &str = "a.btn[href]";
const REVEAL_CONTROL: &str = r#"button[class*="btn-outline"]"#;
const STATE_SCRIPT: &str = r#"script[type="qwik/json"]"#;
const UNKNOWN_TITLE: &str = "Unknown Anime";

fn rendered_episode_path() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/title/\d+-[^/]+/\d+-").expect("static regex"))
}

fn title_slug() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/title/\d+-([a-z0-9\-]+)").expect("static regex"))
}

fn hls_stream(kind: &str) -> &'static Regex {
    static SUB: OnceLock<Regex> = OnceLock::new();
    static DUB: OnceLock<Regex> = OnceLock::new();
    let (cell, pattern) = match kind {
        "dub" => (&DUB, r#""dub"\s*,\s*"(https?://[^\s"']+\.m3u8)""#),
        _ => (&SUB, r#""sub"\s*,\s*"(https?://[^\s"']+\.m3u8)""#),
    };
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

fn english_subtitle() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)"(?:english|eng)"\s*,\s*(?:"[^"]*"\s*,\s*)?"[^"]*\.vtt"\s*,\s*"(https?://[^"]+\.vtt)""#,
        )
        .expect("static regex")
    })
}

fn first_capture(re: &Regex, haystack: &str) -> String {
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Adapter for anixl-style sites: search listings, title pages with episode links, and
/// episode pages carrying their stream table in a `qwik/json` state script.
#[derive(Debug, Clone)]
pub struct AnixlAdapter {
    base_url: Url,
}

impl AnixlAdapter {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    fn resolve(&self, href: &str) -> Option<WorkItemRef> {
        WorkItemRef::resolve(&self.base_url, href)
    }

    fn resolve_image(&self, src: &str) -> String {
        self.base_url
            .join(src)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| src.to_string())
    }
}

impl SiteAdapter for AnixlAdapter {
    fn site_id(&self) -> &'static str {
        "anixl"
    }

    fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn listing_page_url(&self, listing_url: &str, page: u32) -> Result<String, AdapterError> {
        let mut url = self.base_url.join(listing_url)?;
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "page")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("page", &page.to_string());
        Ok(url.to_string())
    }

    fn parse_listing(&self, html: &str) -> Result<Vec<WorkItemRef>, AdapterError> {
        let document = Html::parse_document(html);
        let mut titles = Vec::new();
        append_unique(
            &mut titles,
            select_all_attrs(&document, LISTING_LINK, "href")?
                .iter()
                .filter_map(|href| self.resolve(href)),
        );
        Ok(titles)
    }

    fn parse_title(&self, page_url: &str, html: &str) -> Result<TitlePage, AdapterError> {
        let document = Html::parse_document(html);
        let page = Url::parse(page_url).or_else(|_| self.base_url.join(page_url))?;
        let title_path = page.path().trim_end_matches('/').to_string();

        let cover = selector(COVER_IMAGE)?;
        let cover = document
            .select(&cover)
            .find(|img| img.value().attr("title").is_some_and(|t| !t.trim().is_empty()));
        let (title, image_url) = match cover {
            Some(img) => (
                img.value().attr("title").map(|t| t.trim().to_string()),
                img.value().attr("src").map(|src| self.resolve_image(src)),
            ),
            None => (
                Some(
                    select_first_text(&document, "h1")?
                        .unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
                ),
                None,
            ),
        };

        let mut episodes = Vec::new();
        append_unique(
            &mut episodes,
            select_all_attrs(&document, "a[href]", "href")?
                .iter()
                .filter(|href| {
                    href.starts_with("/title/")
                        && href.contains(&title_path)
                        && href.split('/').count() == 4
                        && !href.contains('?')
                })
                .filter_map(|href| self.resolve(href)),
        );

        let needs_render = select_all_texts(&document, "button")?
            .iter()
            .any(|label| label.contains('-'));

        Ok(TitlePage {
            title,
            image_url,
            episodes,
            needs_render,
        })
    }

    fn parse_rendered_title(
        &self,
        current_url: &str,
        html: &str,
    ) -> Result<RenderedTitle, AdapterError> {
        let document = Html::parse_document(html);

        let cover = selector(RENDERED_COVER_IMAGE)?;
        let cover = document.select(&cover).next();
        let image_url = cover
            .and_then(|img| img.value().attr("src"))
            .map(|src| self.resolve_image(src));
        let title = cover
            .and_then(|img| img.value().attr("title"))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let mut episodes = Vec::new();
        append_unique(
            &mut episodes,
            select_all_attrs(&document, RENDERED_EPISODE_LINK, "href")?
                .iter()
                .filter(|href| rendered_episode_path().is_match(href))
                .filter_map(|href| self.resolve(href)),
        );

        let key = title_slug()
            .captures(current_url)
            .and_then(|c| c.get(1))
            .map(|m| CollectionKey::canonicalize(m.as_str()))
            .unwrap_or_else(CollectionKey::unknown);

        Ok(RenderedTitle {
            key,
            title,
            image_url,
            episodes,
        })
    }

    fn reveal_controls(&self, html: &str) -> Result<Vec<String>, AdapterError> {
        let document = Html::parse_document(html);
        Ok(select_all_texts(&document, REVEAL_CONTROL)?
            .into_iter()
            .filter(|label| label.contains('-'))
            .collect())
    }

    fn parse_episode(&self, html: &str) -> Result<Record, AdapterError> {
        let document = Html::parse_document(html);
        let script = selector(STATE_SCRIPT)?;
        let Some(state) = document.select(&script).next() else {
            return Ok(Record::empty());
        };
        let state = state.text().collect::<String>();

        Ok(Record {
            video: first_capture(hls_stream("sub"), &state),
            subtitle: first_capture(english_subtitle(), &state),
            dub: first_capture(hls_stream("dub"), &state),
        })
    }
}
