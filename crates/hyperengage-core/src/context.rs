// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Page and request context extraction.
//!
//! An [`Environment`] describes where a tracking call happened: a page URL in
//! a browser-like host, or an incoming HTTP request on a server. [`enrich`]
//! turns it into the URL-derived fields of an envelope, including UTM tags
//! and ad click ids parsed from the query string.

use std::collections::BTreeMap;

use http::header::{HOST, REFERER, USER_AGENT};
use serde::{Deserialize, Serialize};
use url::Url;

/// Query parameters recognised as ad click identifiers.
pub const CLICK_ID_PARAMS: &[&str] = &[
	"gclid",
	"fbclid",
	"dclid",
	"gbraid",
	"wbraid",
	"msclkid",
	"yclid",
	"ttclid",
	"twclid",
	"li_fat_id",
];

const UTM_PREFIX: &str = "utm_";
const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Environment handle for a single tracking call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
	pub url: String,
	pub referer: Option<String>,
	pub user_agent: Option<String>,
}

impl Environment {
	/// Environment for a page at `url`.
	pub fn from_url(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			referer: None,
			user_agent: None,
		}
	}

	pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
		self.referer = Some(referer.into());
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = Some(user_agent.into());
		self
	}

	/// Environment for an incoming server request.
	///
	/// Server frameworks usually only see the path of the request URI, so the
	/// absolute URL is rebuilt from the `Host` header and `X-Forwarded-Proto`
	/// (defaulting to `http`).
	pub fn from_request<B>(request: &http::Request<B>) -> Self {
		let headers = request.headers();
		let header = |name: &str| {
			headers
				.get(name)
				.and_then(|v| v.to_str().ok())
				.map(str::to_string)
		};

		let uri = request.uri();
		let url = if uri.scheme().is_some() {
			uri.to_string()
		} else {
			let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
			let host = header(HOST.as_str()).or_else(|| uri.authority().map(|a| a.to_string()));
			match host {
				Some(host) => {
					let scheme = header(FORWARDED_PROTO)
						.and_then(|p| p.split(',').next().map(|s| s.trim().to_string()))
						.filter(|p| !p.is_empty())
						.unwrap_or_else(|| "http".to_string());
					format!("{scheme}://{host}{path_and_query}")
				}
				None => path_and_query.to_string(),
			}
		};

		Self {
			url,
			referer: header(REFERER.as_str()),
			user_agent: header(USER_AGENT.as_str()),
		}
	}
}

/// URL-derived fields attached to an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
	pub url: String,
	pub doc_host: Option<String>,
	pub doc_path: String,
	/// The query string including the leading `?`, or empty.
	pub doc_search: String,
	pub referer: Option<String>,
	pub user_agent: Option<String>,
	pub utm: BTreeMap<String, String>,
	pub click_id: BTreeMap<String, String>,
}

/// Derives page context from an environment handle.
///
/// Never fails: anything that cannot be derived is left empty.
pub fn enrich(env: &Environment) -> PageContext {
	let without_fragment = env.url.split('#').next().unwrap_or_default();
	let (base, query) = match without_fragment.split_once('?') {
		Some((base, query)) => (base, query),
		None => (without_fragment, ""),
	};

	let (doc_host, doc_path) = match Url::parse(without_fragment) {
		Ok(parsed) => (parsed.host_str().map(str::to_string), parsed.path().to_string()),
		Err(_) => (None, base.to_string()),
	};

	let doc_search = if query.is_empty() {
		String::new()
	} else {
		format!("?{query}")
	};

	let (utm, click_id) = parse_query(query);

	PageContext {
		url: env.url.clone(),
		doc_host,
		doc_path,
		doc_search,
		referer: env.referer.clone(),
		user_agent: env.user_agent.clone(),
		utm,
		click_id,
	}
}

/// Splits a raw query string into UTM tags and click ids.
///
/// Later duplicates overwrite earlier ones.
pub fn parse_query(query: &str) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
	let mut utm = BTreeMap::new();
	let mut click_id = BTreeMap::new();

	for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
		if let Some(name) = key.strip_prefix(UTM_PREFIX) {
			if !name.is_empty() {
				utm.insert(name.to_string(), value.into_owned());
			}
		} else if CLICK_ID_PARAMS.contains(&key.as_ref()) {
			click_id.insert(key.into_owned(), value.into_owned());
		}
	}

	(utm, click_id)
}
