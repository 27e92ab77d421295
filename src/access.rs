use uuid::Uuid;

/// Capability set of whoever is asking. The engine never sees a full account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Viewer {
    account_id: Option<Uuid>,
    admin: bool,
}

impl Viewer {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn account(account_id: Uuid) -> Self {
        Self {
            account_id: Some(account_id),
            admin: false,
        }
    }

    pub fn admin(account_id: Uuid) -> Self {
        Self {
            account_id: Some(account_id),
            admin: true,
        }
    }

    pub fn account_id(&self) -> Option<Uuid> {
        self.account_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.account_id.is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.is_authenticated() && self.admin
    }

    pub fn visibility(&self, private: bool, managers: &[Uuid]) -> Visibility {
        Visibility {
            is_public: !private,
            is_admin: self.is_admin(),
            is_manager: self
                .account_id
                .map(|id| managers.contains(&id))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub is_public: bool,
    pub is_admin: bool,
    pub is_manager: bool,
}

impl Visibility {
    pub fn allows_read(self) -> bool {
        self.is_public || self.is_admin || self.is_manager
    }

    pub fn allows_write(self) -> bool {
        self.is_admin || self.is_manager
    }
}
