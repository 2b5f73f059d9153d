//! JSON records printed for each crawled address.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sharecrawl_smb::{CrawlResult, ResponseData};
use std::path::PathBuf;

#[derive(Debug, Serialize)]
pub struct OwnerRecord {
    pub sid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Document {
        url: String,
        method: String,
        status: u16,
        content_length: u64,
        charset: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_modified: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        create_time: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        owner: Option<OwnerRecord>,
        allowed_sids: Vec<String>,
        denied_sids: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        saved_to: Option<PathBuf>,
    },
    Directory {
        url: String,
        children: Vec<String>,
    },
    Error {
        url: String,
        error: String,
        fatal: bool,
    },
}

impl Record {
    pub fn from_response(data: &ResponseData) -> Self {
        Record::Document {
            url: data.url.clone(),
            method: data.method.to_string(),
            status: data.status,
            content_length: data.content_length,
            charset: data.charset.clone(),
            mime_type: data.mime_type.clone(),
            last_modified: data.last_modified,
            create_time: data.create_time,
            owner: data.owner.as_ref().map(|owner| OwnerRecord {
                sid: owner.sid.to_string(),
                account_name: owner.account_name.clone(),
                domain_name: owner.domain_name.clone(),
            }),
            allowed_sids: data.allowed_sids.iter().map(ToString::to_string).collect(),
            denied_sids: data.denied_sids.iter().map(ToString::to_string).collect(),
            saved_to: None,
        }
    }

    pub fn from_result(result: &CrawlResult) -> Self {
        match result {
            CrawlResult::File(data) | CrawlResult::NotFound(data) => Self::from_response(data),
            CrawlResult::Directory { url, children } => Record::Directory {
                url: url.to_string(),
                children: children.iter().map(ToString::to_string).collect(),
            },
        }
    }

    pub fn error(url: &str, error: &sharecrawl_smb::Error) -> Self {
        Record::Error {
            url: url.to_string(),
            error: error.to_string(),
            fatal: error.is_fatal(),
        }
    }

    pub fn with_saved_to(mut self, path: PathBuf) -> Self {
        if let Record::Document { saved_to, .. } = &mut self {
            *saved_to = Some(path);
        }
        self
    }

    pub fn print(&self) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(self)?);
        Ok(())
    }
}
