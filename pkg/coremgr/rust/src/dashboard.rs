// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Links to web control panels for the core's controller API.

use std::collections::BTreeMap;
use urlencoding::encode;

const LOOPBACK: &str = "127.0.0.1";
const DEFAULT_UI_PATH: &str = "ui";

/// Controller endpoint as a dashboard in a local browser must reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controller {
    pub host: String,
    pub port: String,
}

impl Controller {
    /// Parse `host:port`, mapping wildcard or empty hosts to loopback.
    /// Bracketed IPv6 hosts are accepted.
    pub fn parse(address: &str) -> Option<Self> {
        let (host, port) = address.trim().rsplit_once(':')?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let host = match host {
            "" | "0.0.0.0" | "::" | "[::]" => LOOPBACK,
            other => other,
        };
        Some(Self {
            host: host.to_string(),
            port: port.to_string(),
        })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `ui` followed by the encoded segments of the optional UI name.
pub fn ui_path(ui_name: Option<&str>) -> String {
    let mut path = DEFAULT_UI_PATH.to_string();
    for segment in ui_name.unwrap_or_default().split('/').filter(|s| !s.is_empty()) {
        path.push('/');
        path.push_str(&encode(segment));
    }
    path
}

/// One URL per known dashboard, keyed by dashboard name.
pub fn dashboard_urls(
    controller: &Controller,
    secret: &str,
    ui_name: Option<&str>,
) -> BTreeMap<String, String> {
    let host = encode(&controller.host);
    let port = &controller.port;
    let secret = encode(secret);
    let query = format!("hostname={host}&port={port}&secret={secret}");

    let mut urls = BTreeMap::new();
    urls.insert(
        "local".to_string(),
        format!(
            "http://{}/{}/#/setup?{query}",
            controller.authority(),
            ui_path(ui_name)
        ),
    );
    urls.insert(
        "metacubexd".to_string(),
        format!("https://metacubex.github.io/metacubexd/#/setup?http=true&{query}"),
    );
    urls.insert(
        "yacd".to_string(),
        format!("https://yacd.metacubex.one/?{query}"),
    );
    urls.insert(
        "zashboard".to_string(),
        format!("https://board.zash.run.place/#/setup?http=true&{query}"),
    );
    urls
}
