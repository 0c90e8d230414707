//! Plain-text tables for the listing commands

use l4proxy_proto::{BackendServiceUser, ClientInfo};

pub fn render(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let separator = widths
        .iter()
        .map(|w| "-".repeat(w + 2))
        .collect::<Vec<_>>()
        .join("+");
    let separator = format!("+{}+\n", separator);

    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!(" {:<width$} ", cell, width = width))
            .collect();
        format!("|{}|\n", padded.join("|"))
    };

    let titles: Vec<String> = headers.iter().map(|h| h.to_uppercase()).collect();

    let mut out = String::new();
    out.push_str(&separator);
    out.push_str(&line(titles.iter().map(String::as_str).collect()));
    out.push_str(&separator);
    for row in rows {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    if !rows.is_empty() {
        out.push_str(&separator);
    }
    out
}

pub fn clients(clients: &[ClientInfo]) -> String {
    let rows: Vec<Vec<String>> = clients
        .iter()
        .map(|c| {
            vec![
                c.name.clone(),
                c.display_name.clone(),
                c.public_address.clone(),
                c.internal_address.clone(),
                c.registered_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    render(
        &[
            "Name",
            "Display Name",
            "Public Address",
            "Internal Address",
            "Registered",
        ],
        &rows,
    )
}

pub fn users(users: &[BackendServiceUser]) -> String {
    let rows: Vec<Vec<String>> = users.iter().map(|u| vec![u.user_address.clone()]).collect();
    render(&["User Address"], &rows)
}
