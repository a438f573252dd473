use color_eyre::eyre::eyre;
use color_eyre::Result;
use dialoguer::{Confirm, Input, Password, Select};
use std::str::FromStr;

/// Prompt for a string value with optional default
pub fn prompt_string(prompt: &str, default: Option<&str>) -> Result<String> {
    let mut input = Input::<String>::new().with_prompt(prompt).allow_empty(default.is_some());
    if let Some(default_value) = default {
        input = input.default(default_value.to_string());
    }
    let value = input
        .interact_text()
        .map_err(|e| eyre!("Failed to read input: {}", e))?;
    Ok(value.trim().to_string())
}

/// Prompt for a secret (masked input). Empty input keeps the current value.
pub fn prompt_secret(prompt: &str) -> Result<Option<String>> {
    let value = Password::new()
        .with_prompt(prompt)
        .allow_empty_password(true)
        .interact()
        .map_err(|e| eyre!("Failed to read secret: {}", e))?;
    let value = value.trim().to_string();
    Ok((!value.is_empty()).then_some(value))
}

pub fn prompt_yes_no(prompt: &str, default: bool) -> Result<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .map_err(|e| eyre!("Failed to read confirmation: {}", e))
}

/// Prompt until the input parses as `T`
pub fn prompt_parsed<T>(prompt: &str, default: T) -> Result<T>
where
    T: FromStr + ToString + Clone,
{
    Input::<String>::new()
        .with_prompt(prompt)
        .default(default.to_string())
        .validate_with(|input: &String| -> Result<(), String> {
            input
                .trim()
                .parse::<T>()
                .map(|_| ())
                .map_err(|_| format!("'{}' is not a valid value", input.trim()))
        })
        .interact_text()
        .map_err(|e| eyre!("Failed to read input: {}", e))?
        .trim()
        .parse::<T>()
        .map_err(|_| eyre!("Invalid value"))
}

/// Pick one of `items`; returns the chosen index
pub fn prompt_select(prompt: &str, items: &[&str], default: usize) -> Result<usize> {
    Select::new()
        .with_prompt(prompt)
        .items(items)
        .default(default)
        .interact()
        .map_err(|e| eyre!("Failed to read selection: {}", e))
}
