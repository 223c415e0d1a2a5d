// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Built-in endpoint sets for the supported OAuth providers.
//!
//! Client ids are the public ids of each vendor's CLI client. Override any
//! field by registering an [`super::OAuthProvider`] with custom endpoints.

use crate::account::ProviderType;
use crate::pkce::ExtraAuthParams;
use crate::provider::ProviderEndpoints;

pub fn endpoints_for(kind: ProviderType) -> Option<ProviderEndpoints> {
    match kind {
        ProviderType::Claude => Some(claude()),
        ProviderType::OpenAi => Some(openai()),
        ProviderType::Gemini => Some(gemini()),
        _ => None,
    }
}

pub fn claude() -> ProviderEndpoints {
    ProviderEndpoints {
        authorize_url: "https://claude.ai/oauth/authorize".to_owned(),
        token_url: "https://console.anthropic.com/v1/oauth/token".to_owned(),
        client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_owned(),
        client_secret: None,
        redirect_uri: "https://console.anthropic.com/oauth/code/callback".to_owned(),
        scopes: scopes(&["org:create_api_key", "user:profile", "user:inference"]),
        extra_auth_params: ExtraAuthParams {
            leading: vec![("code".to_owned(), "true".to_owned())],
            trailing: vec![],
        },
        send_state_on_exchange: true,
        validate_url: None,
        expected_issuer: None,
        expected_audience: None,
    }
}

pub fn openai() -> ProviderEndpoints {
    ProviderEndpoints {
        authorize_url: "https://auth.openai.com/oauth/authorize".to_owned(),
        token_url: "https://auth.openai.com/oauth/token".to_owned(),
        client_id: "app_EMoamEEZ73f0CkXaXp7hrann".to_owned(),
        client_secret: None,
        redirect_uri: "http://localhost:1455/auth/callback".to_owned(),
        scopes: scopes(&["openid", "profile", "email", "offline_access"]),
        extra_auth_params: ExtraAuthParams {
            leading: vec![],
            trailing: vec![
                ("id_token_add_organizations".to_owned(), "true".to_owned()),
                ("codex_cli_simplified_flow".to_owned(), "true".to_owned()),
            ],
        },
        send_state_on_exchange: false,
        validate_url: None,
        expected_issuer: Some("https://auth.openai.com".to_owned()),
        expected_audience: None,
    }
}

pub fn gemini() -> ProviderEndpoints {
    ProviderEndpoints {
        authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_owned(),
        token_url: "https://oauth2.googleapis.com/token".to_owned(),
        client_id: "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com".to_owned(),
        // Installed-app clients still send a secret; supply it through config.
        client_secret: None,
        redirect_uri: "https://codeassist.google.com/authcode".to_owned(),
        scopes: scopes(&[
            "https://www.googleapis.com/auth/cloud-platform",
            "https://www.googleapis.com/auth/userinfo.email",
            "https://www.googleapis.com/auth/userinfo.profile",
        ]),
        extra_auth_params: ExtraAuthParams {
            leading: vec![],
            trailing: vec![
                ("access_type".to_owned(), "offline".to_owned()),
                ("prompt".to_owned(), "consent".to_owned()),
            ],
        },
        send_state_on_exchange: false,
        validate_url: Some("https://www.googleapis.com/oauth2/v3/userinfo".to_owned()),
        expected_issuer: Some("https://accounts.google.com".to_owned()),
        expected_audience: None,
    }
}

fn scopes(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_owned()).collect()
}
