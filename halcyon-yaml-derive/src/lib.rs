extern crate proc_macro;

use proc_macro::{Delimiter, TokenStream, TokenTree};

/// Derives `halcyon_yaml::FromYaml` for a struct by walking its field list and
/// pulling each field out of the parsed `YamlValue::Map` by name. Missing
/// fields fall back to whatever `Self::default()` already put there, so every
/// derived struct must also implement (or derive) `Default`.
///
/// `#[field(default = "...")]` seeds a field from a yaml literal parsed
/// through the same `Parser` used for the document itself, instead of from
/// `Default::default()`, when the key is absent.
#[proc_macro_derive(FromYaml, attributes(field))]
pub fn derive_from_yaml(input: TokenStream) -> TokenStream {
    let tokens: Vec<TokenTree> = input.into_iter().collect();
    let mut struct_name = String::new();
    let mut fields = Vec::new();
    let mut pending_default = None;

    for i in 0..tokens.len() {
        if let TokenTree::Ident(ref ident) = tokens[i]
            && ident.to_string() == "struct"
            && let Some(TokenTree::Ident(name)) = tokens.get(i + 1)
        {
            struct_name = name.to_string();
        }

        if let TokenTree::Group(ref group) = tokens[i]
            && group.delimiter() == Delimiter::Brace
        {
            let inner: Vec<TokenTree> = group.stream().into_iter().collect();
            for j in 0..inner.len() {
                if let TokenTree::Punct(ref p) = inner[j] {
                    if p.as_char() == '#' {
                        if let Some(TokenTree::Group(g)) = inner.get(j + 1)
                            && g.delimiter() == Delimiter::Bracket
                        {
                            let attr_tokens: Vec<TokenTree> = g.stream().into_iter().collect();
                            if attr_tokens.len() >= 2
                                && let TokenTree::Ident(ref attr_ident) = attr_tokens[0]
                                && attr_ident.to_string() == "field"
                                && let TokenTree::Group(ref attr_group) = attr_tokens[1]
                                && attr_group.delimiter() == Delimiter::Parenthesis
                            {
                                let attr_inner: Vec<TokenTree> =
                                    attr_group.stream().into_iter().collect();
                                for k in 0..attr_inner.len() {
                                    if let TokenTree::Ident(ref key_ident) = attr_inner[k]
                                        && key_ident.to_string() == "default"
                                        && let Some(TokenTree::Punct(eq_punct)) =
                                            attr_inner.get(k + 1)
                                        && eq_punct.as_char() == '='
                                        && let Some(TokenTree::Literal(lit)) = attr_inner.get(k + 2)
                                    {
                                        pending_default = Some(lit.to_string());
                                    }
                                }
                            }
                        }
                        continue;
                    }
                }

                if let TokenTree::Punct(ref p) = inner[j]
                    && p.as_char() == ':'
                    && j > 0
                    && let TokenTree::Ident(ref field_ident) = inner[j - 1]
                {
                    let field_name = field_ident.to_string();
                    if field_name != "pub" && field_name != "crate" {
                        fields.push((field_name, pending_default.take()));
                    }
                }
            }
        }
    }

    let mut body = String::new();
    for (field, default_value) in fields {
        match default_value {
            Some(def) => {
                let clean_def = def.trim_matches('"').replace('\\', "\\\\").replace('"', "\\\"");
                body.push_str(&format!(
                    "if let Some(v) = m.get(\"{field}\") {{ \
                        obj.{field} = halcyon_yaml::FromYaml::from_yaml(v)?; \
                    }} else {{ \
                        let mut p = halcyon_yaml::Parser::new(\"{clean_def}\")?; \
                        let dv = p.parse()?; \
                        obj.{field} = halcyon_yaml::FromYaml::from_yaml(&dv)?; \
                    }}\n",
                    field = field,
                    clean_def = clean_def,
                ));
            }
            None => {
                body.push_str(&format!(
                    "if let Some(v) = m.get(\"{field}\") {{ \
                        obj.{field} = halcyon_yaml::FromYaml::from_yaml(v)?; \
                    }}\n",
                    field = field,
                ));
            }
        }
    }

    let generated = format!(
        "impl halcyon_yaml::FromYaml for {name} {{\n\
            fn from_yaml(value: &halcyon_yaml::YamlValue) -> ::std::result::Result<Self, halcyon_yaml::YamlError> {{\n\
                let mut obj = Self::default();\n\
                let m = match value {{\n\
                    halcyon_yaml::YamlValue::Map(m) => m,\n\
                    _ => return ::std::result::Result::Err(halcyon_yaml::YamlError::Generic(\
                        ::std::format!(\"expected a map for {name}\")\
                    )),\n\
                }};\n\
                {body}\n\
                ::std::result::Result::Ok(obj)\n\
            }}\n\
        }}",
        name = struct_name,
        body = body,
    );

    generated.parse().expect("generated FromYaml impl was invalid")
}
